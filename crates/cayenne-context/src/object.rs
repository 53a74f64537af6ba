//! Persistent objects.
//!
//! A [`DataObject`] is a row image plus relationship slots that reference
//! other objects by [`ObjectId`]. Objects live in the arena of their owning
//! context; callers hold ids and copies, never references into the graph.

use cayenne_core::{
    ContextId, Fault, NO_VERSION, ObjectId, PersistenceState, ToMany, ToOne, Value,
};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One persistent object.
///
/// `values` holds every mapped column, including primary and foreign key
/// columns. Foreign key columns reflect the last committed state; pending
/// relationship changes live in the slots until commit writes them back.
#[derive(Debug, Clone, PartialEq)]
pub struct DataObject {
    id: ObjectId,
    state: PersistenceState,
    context: Option<ContextId>,
    values: BTreeMap<String, Value>,
    to_one: BTreeMap<String, ToOne>,
    to_many: BTreeMap<String, ToMany>,
    snapshot_version: u64,
}

impl DataObject {
    /// A transient object with a fresh temporary id.
    pub fn new(entity: impl Into<String>) -> Self {
        Self::with_id(ObjectId::temporary(entity), PersistenceState::Transient)
    }

    pub(crate) fn with_id(id: ObjectId, state: PersistenceState) -> Self {
        Self {
            id,
            state,
            context: None,
            values: BTreeMap::new(),
            to_one: BTreeMap::new(),
            to_many: BTreeMap::new(),
            snapshot_version: NO_VERSION,
        }
    }

    /// Set a column value on an object that is not registered yet.
    pub fn with_value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn entity(&self) -> &str {
        self.id.entity()
    }

    pub fn state(&self) -> PersistenceState {
        self.state
    }

    /// The owning context, `None` for transient and detached objects.
    pub fn context(&self) -> Option<ContextId> {
        self.context
    }

    /// Column value. Unset columns read as `None`.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn to_one(&self, relationship: &str) -> Option<&ToOne> {
        self.to_one.get(relationship)
    }

    pub fn to_many(&self, relationship: &str) -> Option<&ToMany> {
        self.to_many.get(relationship)
    }

    /// Whether the named relationship is still unresolved. Unknown names
    /// report `true`.
    pub fn is_fault(&self, relationship: &str) -> bool {
        match (self.to_one.get(relationship), self.to_many.get(relationship)) {
            (Some(slot), _) => slot.is_fault(),
            (None, Some(slot)) => slot.is_fault(),
            (None, None) => true,
        }
    }

    /// Version of the snapshot this object was last synchronized with.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    pub(crate) fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    pub(crate) fn set_state(&mut self, state: PersistenceState) {
        self.state = state;
    }

    pub(crate) fn set_context(&mut self, context: Option<ContextId>) {
        self.context = context;
    }

    pub(crate) fn set_snapshot_version(&mut self, version: u64) {
        self.snapshot_version = version;
    }

    pub(crate) fn values_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.values
    }

    pub(crate) fn to_one_mut(&mut self) -> &mut BTreeMap<String, ToOne> {
        &mut self.to_one
    }

    pub(crate) fn to_many_mut(&mut self) -> &mut BTreeMap<String, ToMany> {
        &mut self.to_many
    }

    /// Replace every reference to `old` held by this object.
    pub(crate) fn replace_references(&mut self, old: &ObjectId, new: &ObjectId) {
        for slot in self.to_one.values_mut() {
            slot.replace_id(old, new);
        }
        for slot in self.to_many.values_mut() {
            slot.replace_id(old, new);
        }
    }

    /// Names of the to-one and to-many slots that hold `target`.
    pub(crate) fn slots_referencing(&self, target: &ObjectId) -> (Vec<String>, Vec<String>) {
        let to_one = self
            .to_one
            .iter()
            .filter(|(_, slot)| slot.target() == Some(target))
            .map(|(name, _)| name.clone())
            .collect();
        let to_many = self
            .to_many
            .iter()
            .filter(|(_, slot)| match slot {
                ToMany::Resolved(members) => members.contains(target),
                ToMany::Fault(pending) => pending.added.iter().any(|(id, _)| id == target),
            })
            .map(|(name, _)| name.clone())
            .collect();
        (to_one, to_many)
    }

    /// Drop row data and resolved relationships, keeping the id.
    pub(crate) fn make_hollow(&mut self) {
        self.values.clear();
        for slot in self.to_one.values_mut() {
            *slot = ToOne::Fault;
        }
        for slot in self.to_many.values_mut() {
            *slot = ToMany::fault(slot.kind());
        }
        self.state = PersistenceState::Hollow;
    }

    /// The form this object takes outside of any context.
    ///
    /// New and transient objects keep their values, and their to-many
    /// faults become resolved collections holding the queued additions.
    /// Every other object turns into a HOLLOW copy holding only its id.
    pub fn detached(&self) -> DataObject {
        match self.state {
            PersistenceState::New | PersistenceState::Transient => DataObject {
                id: self.id.clone(),
                state: self.state,
                context: None,
                values: self.values.clone(),
                to_one: self.to_one.clone(),
                to_many: self
                    .to_many
                    .iter()
                    .map(|(name, slot)| (name.clone(), slot.detached()))
                    .collect(),
                snapshot_version: NO_VERSION,
            },
            _ => DataObject {
                snapshot_version: self.snapshot_version,
                ..DataObject::with_id(self.id.clone(), PersistenceState::Hollow)
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DataObjectWire {
    id: ObjectId,
    state: PersistenceState,
    #[serde(default)]
    values: BTreeMap<String, Value>,
    #[serde(default)]
    to_one: BTreeMap<String, ToOne>,
    #[serde(default)]
    to_many: BTreeMap<String, ToMany>,
    #[serde(default)]
    snapshot_version: u64,
}

impl Serialize for DataObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let detached = self.detached();
        DataObjectWire {
            id: detached.id,
            state: detached.state,
            values: detached.values,
            to_one: detached.to_one,
            to_many: detached.to_many,
            snapshot_version: detached.snapshot_version,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = DataObjectWire::deserialize(deserializer)?;
        Ok(DataObject {
            id: wire.id,
            state: wire.state,
            context: None,
            values: wire.values,
            to_one: wire.to_one,
            to_many: wire.to_many,
            snapshot_version: wire.snapshot_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cayenne_core::CollectionType;

    fn new_artist() -> DataObject {
        let mut artist = DataObject::new("Artist").with_value("name", "Monet");
        artist.set_state(PersistenceState::New);
        artist.set_context(Some(ContextId::next()));
        artist
            .to_many_mut()
            .insert("paintings".into(), ToMany::fault(CollectionType::List));
        artist
    }

    #[test]
    fn new_object_round_trip_resolves_to_many() {
        let artist = new_artist();
        assert!(artist.is_fault("paintings"));

        let json = serde_json::to_string(&artist).unwrap();
        let back: DataObject = serde_json::from_str(&json).unwrap();

        assert_eq!(back.context(), None);
        assert_eq!(back.state(), PersistenceState::New);
        assert!(!back.is_fault("paintings"));
        assert!(back.to_many("paintings").unwrap().collection().unwrap().is_empty());
        assert_eq!(back.value("name"), Some(&Value::from("Monet")));
        assert_eq!(back.id(), artist.id());
    }

    #[test]
    fn committed_object_round_trip_is_hollow() {
        let mut artist = DataObject::with_id(
            ObjectId::single("Artist", "id", 5_i64),
            PersistenceState::Committed,
        )
        .with_value("id", 5_i64)
        .with_value("name", "Monet");
        artist.set_context(Some(ContextId::next()));
        artist.to_one_mut().insert("gallery".into(), ToOne::Resolved(None));

        let json = serde_json::to_string(&artist).unwrap();
        let back: DataObject = serde_json::from_str(&json).unwrap();

        assert_eq!(back.state(), PersistenceState::Hollow);
        assert_eq!(back.context(), None);
        assert!(back.values().is_empty());
        assert!(back.to_one("gallery").is_none());
        assert_eq!(back.id(), &ObjectId::single("Artist", "id", 5_i64));
    }

    #[test]
    fn hollow_keeps_slot_shapes() {
        let mut artist = new_artist();
        artist
            .to_many_mut()
            .insert("groups".into(), ToMany::empty(CollectionType::Set));
        artist.make_hollow();
        assert!(artist.values().is_empty());
        assert!(artist.is_fault("groups"));
        assert_eq!(artist.to_many("groups").unwrap().kind(), CollectionType::Set);
    }
}
