//! Object identifiers.
//!
//! An [`ObjectId`] names one persistent object: the entity plus either a
//! permanent primary key map or a temporary key assigned before the row is
//! inserted. Temporary ids carry a shared *replacement map* that commit fills
//! with generated or propagated key values; every clone of the id observes it.

use crate::error::{Error, IdentityErrorKind, Result};
use crate::value::Value;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_TEMPORARY_KEY: AtomicU64 = AtomicU64::new(1);

/// Identity of a persistent object.
#[derive(Clone)]
pub struct ObjectId {
    entity: String,
    key: IdKey,
}

#[derive(Clone)]
enum IdKey {
    Permanent(BTreeMap<String, Value>),
    Temporary {
        key: u64,
        replacement: Arc<Mutex<BTreeMap<String, Value>>>,
    },
}

impl ObjectId {
    /// Create a permanent id from a full primary key map.
    pub fn permanent(entity: impl Into<String>, key: BTreeMap<String, Value>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Permanent(key),
        }
    }

    /// Create a permanent id for a single-column primary key.
    pub fn single(entity: impl Into<String>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut key = BTreeMap::new();
        key.insert(column.into(), value.into());
        Self::permanent(entity, key)
    }

    /// Create a permanent id for a compound primary key.
    pub fn compound<I, K, V>(entity: impl Into<String>, parts: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let key = parts
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::permanent(entity, key)
    }

    /// Create a fresh temporary id. Temporary keys are unique per process.
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Temporary {
                key: NEXT_TEMPORARY_KEY.fetch_add(1, Ordering::Relaxed),
                replacement: Arc::new(Mutex::new(BTreeMap::new())),
            },
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary { .. })
    }

    /// The primary key map of a permanent id.
    pub fn id_snapshot(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.key {
            IdKey::Permanent(map) => Some(map),
            IdKey::Temporary { .. } => None,
        }
    }

    /// Value of one primary key column of a permanent id.
    pub fn key_value(&self, column: &str) -> Option<&Value> {
        self.id_snapshot().and_then(|m| m.get(column))
    }

    pub fn temporary_key(&self) -> Option<u64> {
        match &self.key {
            IdKey::Temporary { key, .. } => Some(*key),
            IdKey::Permanent(_) => None,
        }
    }

    /// Snapshot of the replacement map. Empty for permanent ids.
    pub fn replacement_id_map(&self) -> BTreeMap<String, Value> {
        match &self.key {
            IdKey::Temporary { replacement, .. } => lock(replacement).clone(),
            IdKey::Permanent(_) => BTreeMap::new(),
        }
    }

    /// Whether commit has populated the replacement map.
    pub fn has_replacement_id(&self) -> bool {
        match &self.key {
            IdKey::Temporary { replacement, .. } => !lock(replacement).is_empty(),
            IdKey::Permanent(_) => false,
        }
    }

    /// Record a generated or propagated key value for a temporary id.
    pub fn set_replacement_value(&self, column: impl Into<String>, value: Value) -> Result<()> {
        match &self.key {
            IdKey::Temporary { replacement, .. } => {
                lock(replacement).insert(column.into(), value);
                Ok(())
            }
            IdKey::Permanent(_) => Err(Error::identity(
                IdentityErrorKind::InvalidState,
                format!("permanent id {self} is immutable"),
            )),
        }
    }

    /// Build the permanent id this temporary id turns into after commit.
    ///
    /// A permanent id returns a clone of itself.
    pub fn create_replacement_id(&self) -> Result<ObjectId> {
        match &self.key {
            IdKey::Permanent(_) => Ok(self.clone()),
            IdKey::Temporary { replacement, .. } => {
                let map = lock(replacement).clone();
                if map.is_empty() || map.values().any(Value::is_null) {
                    return Err(Error::identity(
                        IdentityErrorKind::TemporaryId,
                        format!("no replacement key recorded for {self}"),
                    ));
                }
                Ok(ObjectId::permanent(self.entity.clone(), map))
            }
        }
    }
}

fn lock(map: &Mutex<BTreeMap<String, Value>>) -> MutexGuard<'_, BTreeMap<String, Value>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        if self.entity != other.entity {
            return false;
        }
        match (&self.key, &other.key) {
            (IdKey::Temporary { key: a, .. }, IdKey::Temporary { key: b, .. }) => a == b,
            (IdKey::Permanent(a), IdKey::Permanent(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.key_eq(vb))
            }
            _ => false,
        }
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        match &self.key {
            IdKey::Temporary { key, .. } => {
                0u8.hash(state);
                key.hash(state);
            }
            IdKey::Permanent(map) => {
                1u8.hash(state);
                // BTreeMap iteration is sorted by column, so insertion order never matters.
                for (column, value) in map {
                    column.hash(state);
                    value.canonical().hash(state);
                }
            }
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdKey::Temporary { key, .. } => write!(f, "{}<tmp:{}>", self.entity, key),
            IdKey::Permanent(map) => {
                write!(f, "{}<", self.entity)?;
                for (i, (column, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{column}={value}")?;
                }
                write!(f, ">")
            }
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

#[derive(Serialize, Deserialize)]
struct ObjectIdWire {
    entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temporary: Option<u64>,
    #[serde(default)]
    key: BTreeMap<String, Value>,
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let wire = match &self.key {
            IdKey::Permanent(map) => ObjectIdWire {
                entity: self.entity.clone(),
                temporary: None,
                key: map.clone(),
            },
            IdKey::Temporary { key, replacement } => ObjectIdWire {
                entity: self.entity.clone(),
                temporary: Some(*key),
                key: lock(replacement).clone(),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = ObjectIdWire::deserialize(deserializer)?;
        let key = match wire.temporary {
            Some(key) => IdKey::Temporary {
                key,
                replacement: Arc::new(Mutex::new(wire.key)),
            },
            None => IdKey::Permanent(wire.key),
        };
        Ok(Self {
            entity: wire.entity,
            key,
        })
    }
}
