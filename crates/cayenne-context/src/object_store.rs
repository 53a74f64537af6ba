//! Identity map of a context.
//!
//! The store owns every registered [`DataObject`] in an arena keyed by
//! [`ObjectId`]. Each id maps to exactly one instance per store. Objects in
//! the NEW, MODIFIED and DELETED states are additionally indexed by
//! registration order, so commit planning never scans the whole arena.

use crate::object::DataObject;
use cayenne_core::{ContextId, Error, IdentityErrorKind, ObjectId, PersistenceState, Result};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
struct Registered {
    object: DataObject,
    seq: u64,
}

/// Per-context identity map with state buckets.
#[derive(Debug)]
pub struct ObjectStore {
    context: ContextId,
    objects: HashMap<ObjectId, Registered>,
    next_seq: u64,
    new_objects: BTreeMap<u64, ObjectId>,
    modified_objects: BTreeMap<u64, ObjectId>,
    deleted_objects: BTreeMap<u64, ObjectId>,
    /// Temporary ids replaced at commit -> permanent ids.
    replaced: HashMap<ObjectId, ObjectId>,
}

impl ObjectStore {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            objects: HashMap::new(),
            next_seq: 0,
            new_objects: BTreeMap::new(),
            modified_objects: BTreeMap::new(),
            deleted_objects: BTreeMap::new(),
            replaced: HashMap::new(),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Register a transient object as NEW.
    ///
    /// The object keeps its temporary id; an object carrying a permanent id
    /// gets a fresh temporary one. Objects owned by another context are
    /// rejected and left untouched.
    #[tracing::instrument(level = "trace", skip(self, object), fields(context = %self.context))]
    pub fn register_new(&mut self, mut object: DataObject) -> Result<ObjectId> {
        if let Some(owner) = object.context() {
            return Err(Error::identity(
                IdentityErrorKind::AlreadyRegistered,
                format!("{} is already registered in {owner}", object.id()),
            ));
        }
        if !object.id().is_temporary() {
            object.set_id(ObjectId::temporary(object.entity()));
        }
        if self.objects.contains_key(object.id()) {
            return Err(Error::identity(
                IdentityErrorKind::AlreadyRegistered,
                format!("{} is already registered in {}", object.id(), self.context),
            ));
        }
        object.set_state(PersistenceState::New);
        object.set_context(Some(self.context));
        let id = object.id().clone();
        self.insert(object);
        tracing::trace!(id = %id, "Registered new object");
        Ok(id)
    }

    /// Put an object into the arena, replacing any instance with the same id.
    pub(crate) fn insert(&mut self, mut object: DataObject) {
        object.set_context(Some(self.context));
        let id = object.id().clone();
        let seq = match self.objects.get(&id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.unindex(seq);
        self.index(&id, seq, object.state());
        self.objects.insert(id, Registered { object, seq });
    }

    fn bucket_mut(&mut self, state: PersistenceState) -> Option<&mut BTreeMap<u64, ObjectId>> {
        match state {
            PersistenceState::New => Some(&mut self.new_objects),
            PersistenceState::Modified => Some(&mut self.modified_objects),
            PersistenceState::Deleted => Some(&mut self.deleted_objects),
            _ => None,
        }
    }

    fn bucket(&self, state: PersistenceState) -> Option<&BTreeMap<u64, ObjectId>> {
        match state {
            PersistenceState::New => Some(&self.new_objects),
            PersistenceState::Modified => Some(&self.modified_objects),
            PersistenceState::Deleted => Some(&self.deleted_objects),
            _ => None,
        }
    }

    fn index(&mut self, id: &ObjectId, seq: u64, state: PersistenceState) {
        if let Some(bucket) = self.bucket_mut(state) {
            bucket.insert(seq, id.clone());
        }
    }

    fn unindex(&mut self, seq: u64) {
        self.new_objects.remove(&seq);
        self.modified_objects.remove(&seq);
        self.deleted_objects.remove(&seq);
    }

    /// The id an object is registered under, following commit-time id
    /// replacement.
    pub fn resolve_id(&self, id: &ObjectId) -> ObjectId {
        if self.objects.contains_key(id) {
            return id.clone();
        }
        self.replaced.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    fn entry(&self, id: &ObjectId) -> Option<&Registered> {
        self.objects
            .get(id)
            .or_else(|| self.replaced.get(id).and_then(|p| self.objects.get(p)))
    }

    /// The registered instance for an id.
    pub fn node(&self, id: &ObjectId) -> Option<&DataObject> {
        self.entry(id).map(|r| &r.object)
    }

    pub(crate) fn node_mut(&mut self, id: &ObjectId) -> Option<&mut DataObject> {
        let key = self.resolve_id(id);
        self.objects.get_mut(&key).map(|r| &mut r.object)
    }

    /// Registered instance or a `NotRegistered` error.
    pub fn require(&self, id: &ObjectId) -> Result<&DataObject> {
        self.node(id).ok_or_else(|| not_registered(id, self.context))
    }

    pub(crate) fn require_mut(&mut self, id: &ObjectId) -> Result<&mut DataObject> {
        let context = self.context;
        self.node_mut(id).ok_or_else(|| not_registered(id, context))
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.entry(id).is_some()
    }

    /// Registration order of an object, used as a stable tie breaker.
    pub fn seq(&self, id: &ObjectId) -> Option<u64> {
        self.entry(id).map(|r| r.seq)
    }

    /// Move an object to another state, keeping the buckets in sync.
    pub(crate) fn set_state(&mut self, id: &ObjectId, state: PersistenceState) -> Result<()> {
        let key = self.resolve_id(id);
        let context = self.context;
        let seq = {
            let entry = self
                .objects
                .get_mut(&key)
                .ok_or_else(|| not_registered(id, context))?;
            entry.object.set_state(state);
            entry.seq
        };
        self.unindex(seq);
        self.index(&key, seq, state);
        Ok(())
    }

    /// [`set_state`](Self::set_state) for an object the caller found
    /// registered. A miss means the identity map lost track of the object.
    pub(crate) fn transition(&mut self, id: &ObjectId, state: PersistenceState) {
        if let Err(e) = self.set_state(id, state) {
            tracing::warn!(object = %id, %state, error = %e, "State change of an unregistered object");
            debug_assert!(false, "state change of an unregistered object: {e}");
        }
    }

    /// Ids in a state, in registration order for the dirty states.
    pub fn ids_in_state(&self, state: PersistenceState) -> Vec<ObjectId> {
        if let Some(bucket) = self.bucket(state) {
            return bucket.values().cloned().collect();
        }
        let mut found: Vec<&Registered> = self
            .objects
            .values()
            .filter(|r| r.object.state() == state)
            .collect();
        found.sort_by_key(|r| r.seq);
        found.into_iter().map(|r| r.object.id().clone()).collect()
    }

    pub fn objects_in_state(&self, state: PersistenceState) -> Vec<&DataObject> {
        self.ids_in_state(state)
            .iter()
            .filter_map(|id| self.node(id))
            .collect()
    }

    pub fn has_dirty_objects(&self) -> bool {
        !(self.new_objects.is_empty()
            && self.modified_objects.is_empty()
            && self.deleted_objects.is_empty())
    }

    /// Remove an object from the store. It becomes TRANSIENT with no
    /// context. References held by other objects are left alone.
    pub(crate) fn unregister(&mut self, id: &ObjectId) -> Option<DataObject> {
        let key = self.resolve_id(id);
        let entry = self.objects.remove(&key)?;
        self.unindex(entry.seq);
        self.replaced.retain(|_, permanent| *permanent != key);
        let mut object = entry.object;
        object.set_state(PersistenceState::Transient);
        object.set_context(None);
        tracing::trace!(id = %key, "Unregistered object");
        Some(object)
    }

    /// Re-key an object and rewrite every reference to it.
    #[tracing::instrument(level = "debug", skip(self), fields(context = %self.context))]
    pub(crate) fn process_id_change(&mut self, old: &ObjectId, new: &ObjectId) {
        let Some(mut entry) = self.objects.remove(old) else {
            return;
        };
        entry.object.set_id(new.clone());
        let seq = entry.seq;
        self.objects.insert(new.clone(), entry);
        self.unindex(seq);
        let state = self
            .objects
            .get(new)
            .map_or(PersistenceState::Transient, |r| r.object.state());
        self.index(new, seq, state);

        for registered in self.objects.values_mut() {
            registered.object.replace_references(old, new);
        }
        if old.is_temporary() {
            self.replaced.insert(old.clone(), new.clone());
        }
    }

    /// Clones of every registered object, in registration order.
    pub fn snapshot_objects(&self) -> Vec<DataObject> {
        let mut all: Vec<&Registered> = self.objects.values().collect();
        all.sort_by_key(|r| r.seq);
        all.into_iter().map(|r| r.object.clone()).collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects.keys()
    }

    pub(crate) fn objects(&self) -> impl Iterator<Item = &DataObject> {
        self.objects.values().map(|r| &r.object)
    }

    pub(crate) fn objects_mut(&mut self) -> impl Iterator<Item = &mut DataObject> {
        self.objects.values_mut().map(|r| &mut r.object)
    }
}

fn not_registered(id: &ObjectId, context: ContextId) -> Error {
    Error::identity(
        IdentityErrorKind::NotRegistered,
        format!("{id} is not registered in {context}"),
    )
}
