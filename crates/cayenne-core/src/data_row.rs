//! Row snapshots.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version token for rows that were never stamped by a snapshot cache.
pub const NO_VERSION: u64 = 0;

/// A row keyed by column name.
///
/// Nodes return rows in this shape and the snapshot cache stores them as the
/// last-known committed state of an object. `version` is stamped by the
/// cache; `replaces_version` is the version this row superseded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataRow {
    values: BTreeMap<String, Value>,
    version: u64,
    replaces_version: u64,
}

impl DataRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self {
            values,
            version: NO_VERSION,
            replaces_version: NO_VERSION,
        }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::from_values(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Typed access to a column. A missing column reads as NULL.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T>(&self, column: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.values.get(column).cloned().unwrap_or(Value::Null);
        T::try_from(value).map_err(|e| match e {
            Error::Type(t) => Error::Type(TypeError {
                column: Some(column.to_string()),
                ..t
            }),
            other => other,
        })
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(column.into(), value)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.values.remove(column)
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn replaces_version(&self) -> u64 {
        self.replaces_version
    }

    /// Stamp a new version together with the version it supersedes.
    pub fn stamp(&mut self, version: u64, replaces_version: u64) {
        self.replaces_version = replaces_version;
        self.version = version;
    }

    /// Extract columns stored under `prefix.` as a row of their own.
    ///
    /// Used to split joint prefetch rows into parent and related parts.
    /// Returns `None` when every prefixed column is NULL (outer join miss).
    pub fn prefixed(&self, prefix: &str) -> Option<DataRow> {
        let lead = format!("{prefix}.");
        let mut out = BTreeMap::new();
        let mut any_value = false;
        for (column, value) in &self.values {
            if let Some(rest) = column.strip_prefix(&lead) {
                if rest.contains('.') {
                    continue;
                }
                any_value |= !value.is_null();
                out.insert(rest.to_string(), value.clone());
            }
        }
        any_value.then(|| DataRow::from_values(out))
    }

    /// Same row without dotted (joined or synthetic) columns.
    pub fn unprefixed(&self) -> DataRow {
        let values = self
            .values
            .iter()
            .filter(|(column, _)| !column.contains('.'))
            .map(|(c, v)| (c.clone(), v.clone()))
            .collect();
        DataRow {
            values,
            version: self.version,
            replaces_version: self.replaces_version,
        }
    }

    /// Compare column values, ignoring version tokens and numeric widths.
    pub fn same_values(&self, other: &DataRow) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .all(|(k, v)| other.values.get(k).is_some_and(|o| o.key_eq(v)))
    }
}

impl FromIterator<(String, Value)> for DataRow {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self::from_values(iter.into_iter().collect())
    }
}
