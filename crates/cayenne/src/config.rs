//! Runtime configuration.

use cayenne_cache::{DEFAULT_SNAPSHOT_CACHE_SIZE, StoreConfig};
use cayenne_context::{ContextConfig, DEFAULT_MAX_ID_QUALIFIER_SIZE, SorterKind};
use cayenne_core::{ConfigError, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Property holding the snapshot cache capacity.
pub const SNAPSHOT_CACHE_SIZE_PROPERTY: &str = "cayenne.DataRowStore.snapshot.size";
/// Property holding the maximum number of ids per prefetch IN qualifier.
pub const MAX_ID_QUALIFIER_SIZE_PROPERTY: &str = "cayenne.server.max_id_qualifier_size";
/// Property naming the commit sorter.
pub const COMMIT_SORTER_PROPERTY: &str = "cayenne.commit.sorter";
/// Property switching the pre-commit snapshot version check.
pub const VALIDATE_VERSIONS_PROPERTY: &str = "cayenne.commit.validate_versions";

/// Configuration shared by a runtime and its contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime name used in logs and as the snapshot cache name
    pub name: String,
    /// Maximum number of cached snapshots
    pub snapshot_cache_size: usize,
    /// Maximum ids per disjoint prefetch IN qualifier; zero or less
    /// disables batching
    pub max_id_qualifier_size: i32,
    #[serde(with = "sorter_name")]
    pub sorter: SorterKind,
    /// Reject commits of optimistically locked objects another context
    /// changed since they were read
    pub validate_optimistic_versions: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "cayenne".to_string(),
            snapshot_cache_size: DEFAULT_SNAPSHOT_CACHE_SIZE,
            max_id_qualifier_size: DEFAULT_MAX_ID_QUALIFIER_SIZE,
            sorter: SorterKind::EntityOrder,
            validate_optimistic_versions: true,
        }
    }
}

fn invalid(key: &str, message: String, source: Option<Box<dyn std::error::Error + Send + Sync>>) -> Error {
    Error::Config(ConfigError {
        key: Some(key.to_string()),
        message,
        source,
    })
}

fn parse<T>(properties: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = properties.get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| invalid(key, format!("invalid value '{raw}' for {key}"), Some(Box::new(e))))
}

impl RuntimeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Read a configuration from properties, starting from the defaults.
    /// Unknown keys are ignored; malformed values are errors.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(size) = parse::<usize>(properties, SNAPSHOT_CACHE_SIZE_PROPERTY)? {
            if size == 0 {
                return Err(invalid(
                    SNAPSHOT_CACHE_SIZE_PROPERTY,
                    format!("{SNAPSHOT_CACHE_SIZE_PROPERTY} must be positive"),
                    None,
                ));
            }
            config.snapshot_cache_size = size;
        }
        if let Some(size) = parse::<i32>(properties, MAX_ID_QUALIFIER_SIZE_PROPERTY)? {
            config.max_id_qualifier_size = size;
        }
        if let Some(raw) = properties.get(COMMIT_SORTER_PROPERTY) {
            config.sorter = raw.parse().map_err(|e: Error| {
                invalid(COMMIT_SORTER_PROPERTY, e.to_string(), None)
            })?;
        }
        if let Some(validate) = parse::<bool>(properties, VALIDATE_VERSIONS_PROPERTY)? {
            config.validate_optimistic_versions = validate;
        }
        tracing::debug!(
            snapshot_cache_size = config.snapshot_cache_size,
            max_id_qualifier_size = config.max_id_qualifier_size,
            sorter = %config.sorter,
            "Runtime configuration loaded"
        );
        Ok(config)
    }

    pub fn snapshot_cache_size(mut self, size: usize) -> Self {
        self.snapshot_cache_size = size.max(1);
        self
    }

    pub fn max_id_qualifier_size(mut self, size: i32) -> Self {
        self.max_id_qualifier_size = size;
        self
    }

    pub fn sorter(mut self, sorter: SorterKind) -> Self {
        self.sorter = sorter;
        self
    }

    pub fn validate_optimistic_versions(mut self, enabled: bool) -> Self {
        self.validate_optimistic_versions = enabled;
        self
    }

    pub(crate) fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.name.clone()).capacity(self.snapshot_cache_size)
    }

    pub(crate) fn context_config(&self) -> ContextConfig {
        ContextConfig {
            max_id_qualifier_size: self.max_id_qualifier_size,
            sorter: self.sorter.sorter(),
            validate_optimistic_versions: self.validate_optimistic_versions,
        }
    }
}

mod sorter_name {
    use cayenne_context::SorterKind;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(sorter: &SorterKind, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(sorter.as_str())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SorterKind, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.snapshot_cache_size, 10_000);
        assert_eq!(config.max_id_qualifier_size, 10_000);
        assert_eq!(config.sorter, SorterKind::EntityOrder);
        assert!(config.validate_optimistic_versions);
    }

    #[test]
    fn reads_properties() {
        let config = RuntimeConfig::from_properties(&properties(&[
            (SNAPSHOT_CACHE_SIZE_PROPERTY, "500"),
            (MAX_ID_QUALIFIER_SIZE_PROPERTY, " -1 "),
            (COMMIT_SORTER_PROPERTY, "object-graph"),
            (VALIDATE_VERSIONS_PROPERTY, "false"),
            ("cayenne.unrelated", "x"),
        ]))
        .unwrap();
        assert_eq!(config.snapshot_cache_size, 500);
        assert_eq!(config.max_id_qualifier_size, -1);
        assert_eq!(config.sorter, SorterKind::ObjectGraph);
        assert!(!config.validate_optimistic_versions);
    }

    #[test]
    fn malformed_values_name_their_key() {
        for (key, value) in [
            (SNAPSHOT_CACHE_SIZE_PROPERTY, "lots"),
            (SNAPSHOT_CACHE_SIZE_PROPERTY, "0"),
            (MAX_ID_QUALIFIER_SIZE_PROPERTY, "1.5"),
            (COMMIT_SORTER_PROPERTY, "fastest"),
        ] {
            match RuntimeConfig::from_properties(&properties(&[(key, value)])) {
                Err(Error::Config(e)) => assert_eq!(e.key.as_deref(), Some(key)),
                other => panic!("expected a config error for {key}={value}, got {other:?}"),
            }
        }
    }

    #[test]
    fn serde_uses_sorter_names() {
        let config = RuntimeConfig::default().sorter(SorterKind::ObjectGraph);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"object-graph\""));
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
