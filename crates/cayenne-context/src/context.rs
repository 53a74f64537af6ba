//! The object context: identity map, change log and relationship graph of
//! one unit of work.
//!
//! Synchronous operations here mutate the in-memory graph only. Operations
//! that may need the data node (fault resolution, prefetching, deletes with
//! rules, commit) are async and live in the sibling modules.

use crate::callbacks::{ContextCallbacks, LifecycleEvent};
use crate::change_log::{ChangeLog, FlattenedChange, same_value};
use crate::flush::{EntityOrderSorter, OperationSorter};
use crate::object::DataObject;
use crate::object_store::ObjectStore;
use crate::unit_of_work::foreign_key_target;
use cayenne_cache::{DataRowStore, SnapshotChanges, Subscription};
use cayenne_core::{
    CompoundDiff, ContextId, DataNode, DataRow, EntityDescriptor, EntityResolver, Error, FkSide,
    GraphChangeHandler, IdentityErrorKind, MappingError, ObjectId, PersistenceState,
    Relationship, Result, ToMany, ToOne, Value,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default maximum number of ids in one prefetch IN qualifier.
pub const DEFAULT_MAX_ID_QUALIFIER_SIZE: i32 = 10_000;

/// Configuration for context behavior.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Maximum ids per IN qualifier of disjoint prefetches. Zero or a
    /// negative value disables batching.
    pub max_id_qualifier_size: i32,
    /// Commit ordering strategy.
    pub sorter: Arc<dyn OperationSorter>,
    /// Compare cached snapshot versions of optimistically locked objects
    /// before commit.
    pub validate_optimistic_versions: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_id_qualifier_size: DEFAULT_MAX_ID_QUALIFIER_SIZE,
            sorter: Arc::new(EntityOrderSorter),
            validate_optimistic_versions: true,
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_id_qualifier_size(mut self, size: i32) -> Self {
        self.max_id_qualifier_size = size;
        self
    }

    pub fn sorter(mut self, sorter: impl OperationSorter + 'static) -> Self {
        self.sorter = Arc::new(sorter);
        self
    }

    pub fn validate_optimistic_versions(mut self, enabled: bool) -> Self {
        self.validate_optimistic_versions = enabled;
        self
    }
}

/// A unit of work over one data node.
///
/// The context owns its objects; callers address them by [`ObjectId`].
/// It is single-owner: wrap it in a [`SharedContext`] to use it from
/// several threads.
pub struct ObjectContext<N: DataNode> {
    id: ContextId,
    node: Arc<N>,
    resolver: Arc<EntityResolver>,
    cache: Arc<DataRowStore>,
    config: ContextConfig,
    pub(crate) store: ObjectStore,
    pub(crate) log: ChangeLog,
    pub(crate) callbacks: ContextCallbacks,
    pub(crate) parent: Option<ContextId>,
    subscription: Subscription,
}

impl<N: DataNode> std::fmt::Debug for ObjectContext<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectContext")
            .field("id", &self.id)
            .field("node", &self.node.name())
            .field("objects", &self.store.len())
            .field("changes", &self.log.len())
            .field("parent", &self.parent)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl<N: DataNode> Drop for ObjectContext<N> {
    fn drop(&mut self) {
        self.cache.unsubscribe(self.id);
    }
}

pub(crate) fn init_slots(entity: &EntityDescriptor, object: &mut DataObject, new: bool) {
    for rel in entity.relationships() {
        if rel.to_many {
            object
                .to_many_mut()
                .entry(rel.name.clone())
                .or_insert_with(|| ToMany::fault(rel.collection));
        } else {
            let slot = if new { ToOne::Resolved(None) } else { ToOne::Fault };
            object.to_one_mut().entry(rel.name.clone()).or_insert(slot);
        }
    }
}

fn invalid_state(message: impl Into<String>) -> Error {
    Error::identity(IdentityErrorKind::InvalidState, message)
}

fn unknown_property(message: impl Into<String>) -> Error {
    Error::identity(IdentityErrorKind::UnknownProperty, message)
}

impl<N: DataNode> ObjectContext<N> {
    /// Create a context and subscribe it to the snapshot cache.
    pub fn new(
        node: Arc<N>,
        resolver: Arc<EntityResolver>,
        cache: Arc<DataRowStore>,
        config: ContextConfig,
    ) -> Self {
        let id = ContextId::next();
        let subscription = cache.subscribe(id);
        tracing::debug!(context = %id, node = node.name(), "Object context created");
        Self {
            id,
            node,
            resolver,
            cache,
            config,
            store: ObjectStore::new(id),
            log: ChangeLog::new(),
            callbacks: ContextCallbacks::default(),
            parent: None,
            subscription,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn data_node(&self) -> &Arc<N> {
        &self.node
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<DataRowStore> {
        &self.cache
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.log
    }

    /// Snapshot of the changes recorded since the last commit or rollback.
    pub fn current_diff(&self) -> CompoundDiff {
        self.log.current_diff()
    }

    /// The registered instance for an id.
    pub fn node(&self, id: &ObjectId) -> Option<&DataObject> {
        self.store.node(id)
    }

    /// State of an object; unknown ids are TRANSIENT.
    pub fn state(&self, id: &ObjectId) -> PersistenceState {
        self.store
            .node(id)
            .map_or(PersistenceState::Transient, DataObject::state)
    }

    pub fn has_changes(&self) -> bool {
        self.store.has_dirty_objects() || !self.log.flattened_changes().is_empty()
    }

    pub fn objects_in_state(&self, state: PersistenceState) -> Vec<ObjectId> {
        self.store.ids_in_state(state)
    }

    /// Create and register a NEW object of an entity.
    pub fn new_object(&mut self, entity: &str) -> Result<ObjectId> {
        self.register_new_object(DataObject::new(entity))
    }

    /// Register a transient or detached object as NEW.
    ///
    /// Fails without side effects when the object belongs to a context or
    /// carries columns its entity does not map.
    pub fn register_new_object(&mut self, mut object: DataObject) -> Result<ObjectId> {
        let resolver = Arc::clone(&self.resolver);
        let entity = resolver.entity(object.entity())?;
        if let Some(column) = object
            .values()
            .keys()
            .find(|c| entity.find_attribute(c).is_none())
        {
            return Err(unknown_property(format!(
                "attribute '{}.{column}' is not mapped",
                entity.name
            )));
        }
        init_slots(entity, &mut object, true);
        let id = self.store.register_new(object)?;
        if let Err(e) = self.fire_lifecycle(LifecycleEvent::PrePersist, &id) {
            self.store.unregister(&id);
            return Err(e);
        }
        self.log.record_create(&id);
        Ok(id)
    }

    /// Registered, writable object id.
    fn writable(&self, id: &ObjectId) -> Result<ObjectId> {
        let object = self.store.require(id)?;
        match object.state() {
            PersistenceState::Deleted | PersistenceState::Transient => Err(invalid_state(format!(
                "{} is {} and cannot be changed",
                object.id(),
                object.state()
            ))),
            _ => Ok(object.id().clone()),
        }
    }

    /// Relationship target that is registered here and of the right entity.
    fn linkable(&self, target: &ObjectId, rel: &Relationship) -> Result<ObjectId> {
        let Some(object) = self.store.node(target) else {
            return Err(Error::identity(
                IdentityErrorKind::ForeignContext,
                format!(
                    "{target} is not registered in {} and cannot be linked by '{}.{}'",
                    self.id, rel.source, rel.name
                ),
            ));
        };
        if object.entity() != rel.target {
            return Err(invalid_state(format!(
                "'{}.{}' expects {}, got {}",
                rel.source, rel.name, rel.target, target
            )));
        }
        if object.state() == PersistenceState::Deleted {
            return Err(invalid_state(format!("{target} is deleted")));
        }
        Ok(object.id().clone())
    }

    /// Fill a HOLLOW object from the snapshot cache.
    pub(crate) fn ensure_loaded(&mut self, id: &ObjectId) -> Result<()> {
        match self.store.require(id)?.state() {
            PersistenceState::Hollow => {
                let Some(row) = self.cache.cached_snapshot(id) else {
                    return Err(invalid_state(format!(
                        "{id} is HOLLOW and not cached; read it before changing it"
                    )));
                };
                let resolver = Arc::clone(&self.resolver);
                let entity = resolver.entity(id.entity())?;
                self.merge_row(entity, id, row);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Merge a fetched or cached row into the registered instance, creating
    /// a COMMITTED object if the id is not registered yet. Dirty objects
    /// keep their state.
    pub(crate) fn merge_row(&mut self, entity: &EntityDescriptor, id: &ObjectId, row: DataRow) {
        let version = row.version();
        match self.store.node(id).map(DataObject::state) {
            None => {
                let mut object = DataObject::with_id(id.clone(), PersistenceState::Committed);
                *object.values_mut() = row.into_values();
                object.set_snapshot_version(version);
                init_slots(entity, &mut object, false);
                self.store.insert(object);
                self.notify_lifecycle(LifecycleEvent::PostLoad, id);
            }
            Some(PersistenceState::Hollow) => {
                if let Some(object) = self.store.node_mut(id) {
                    *object.values_mut() = row.into_values();
                    object.set_snapshot_version(version);
                    init_slots(entity, object, false);
                }
                self.store.transition(id, PersistenceState::Committed);
                self.notify_lifecycle(LifecycleEvent::PostLoad, id);
            }
            Some(PersistenceState::Committed) => {
                let Some(object) = self.store.node_mut(id) else {
                    return;
                };
                if object.snapshot_version() == version && version != cayenne_core::NO_VERSION {
                    return;
                }
                let stale: Vec<String> = entity
                    .relationships()
                    .iter()
                    .filter(|rel| !rel.to_many && rel.fk_side() == FkSide::Source)
                    .filter(|rel| {
                        rel.source_columns().any(|c| {
                            let old = object.value(c).unwrap_or(&Value::Null);
                            let new = row.get(c).unwrap_or(&Value::Null);
                            !same_value(old, new)
                        })
                    })
                    .map(|rel| rel.name.clone())
                    .collect();
                *object.values_mut() = row.into_values();
                object.set_snapshot_version(version);
                for name in stale {
                    object.to_one_mut().insert(name, ToOne::Fault);
                }
                self.notify_lifecycle(LifecycleEvent::PostLoad, id);
            }
            Some(_) => {}
        }
    }

    pub(crate) fn mark_modified(&mut self, id: &ObjectId) {
        if self.state(id) == PersistenceState::Committed {
            self.store.transition(id, PersistenceState::Modified);
        }
    }

    /// Value of a column, falling back to the primary key of the id.
    pub(crate) fn column_value(&self, id: &ObjectId, column: &str) -> Value {
        let id = self.store.resolve_id(id);
        self.store
            .node(&id)
            .and_then(|o| o.value(column))
            .filter(|v| !v.is_null())
            .or_else(|| id.key_value(column))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Target id named by the foreign key columns of a source-side to-one.
    pub(crate) fn fk_target(&self, object: &DataObject, rel: &Relationship) -> Option<ObjectId> {
        foreign_key_target(object, rel).map(|target| self.store.resolve_id(&target))
    }

    /// Current to-one target: `Some(target)` when known, `None` when the
    /// slot is a fault that cannot be answered from memory.
    pub(crate) fn current_to_one(&self, id: &ObjectId, rel: &Relationship) -> Option<Option<ObjectId>> {
        let object = self.store.node(id)?;
        match object.to_one(&rel.name) {
            Some(ToOne::Resolved(target)) => {
                Some(target.as_ref().map(|t| self.store.resolve_id(t)))
            }
            _ if rel.fk_side() == FkSide::Source
                && object.state() != PersistenceState::Hollow =>
            {
                Some(self.fk_target(object, rel))
            }
            _ => None,
        }
    }

    /// Set a column value.
    ///
    /// Foreign key columns are owned by their relationships and primary
    /// keys can only be assigned before the first commit.
    #[tracing::instrument(level = "trace", skip(self, value), fields(context = %self.id))]
    pub fn write_property(&mut self, id: &ObjectId, property: &str, value: Value) -> Result<()> {
        self.sync_snapshot_events();
        let resolver = Arc::clone(&self.resolver);
        let entity = resolver.entity(id.entity())?;
        let attribute = entity.find_attribute(property).ok_or_else(|| {
            unknown_property(format!("attribute '{}.{property}' is not mapped", entity.name))
        })?;
        if let Some(rel) = entity.relationships().iter().find(|rel| {
            !rel.to_many
                && rel.fk_side() == FkSide::Source
                && rel.source_columns().any(|c| c == property)
        }) {
            return Err(invalid_state(format!(
                "column '{}.{property}' is managed by relationship '{}'",
                entity.name, rel.name
            )));
        }
        let id = self.writable(id)?;
        self.ensure_loaded(&id)?;
        let object = self.store.require(&id)?;
        if attribute.primary_key && object.state() != PersistenceState::New {
            return Err(invalid_state(format!(
                "primary key '{property}' of {id} cannot change after insert"
            )));
        }
        let old = object.value(property).cloned().unwrap_or(Value::Null);
        if same_value(&old, &value) {
            return Ok(());
        }
        self.log.record_property_change(&id, property, &old, &value);
        self.store.require_mut(&id)?.values_mut().insert(property.to_string(), value);
        self.mark_modified(&id);
        Ok(())
    }

    /// Point a to-one relationship at `target`, or clear it.
    ///
    /// The reverse relationship is kept in sync. The target must be
    /// registered in this context.
    #[tracing::instrument(level = "trace", skip(self), fields(context = %self.id))]
    pub fn set_to_one(&mut self, id: &ObjectId, relationship: &str, target: Option<&ObjectId>) -> Result<()> {
        self.sync_snapshot_events();
        let resolver = Arc::clone(&self.resolver);
        let rel = resolver.relationship(id.entity(), relationship)?;
        if rel.to_many {
            return Err(unknown_property(format!(
                "'{}.{relationship}' is a to-many relationship",
                id.entity()
            )));
        }
        let id = self.writable(id)?;
        let target = target.map(|t| self.linkable(t, rel)).transpose()?;
        if rel.fk_side() == FkSide::Source {
            self.ensure_loaded(&id)?;
        }
        if let (Some(t), Some(reverse)) = (&target, resolver.reverse_of(rel)) {
            if !reverse.to_many && reverse.fk_side() == FkSide::Source {
                self.ensure_loaded(t)?;
            }
        }
        self.set_to_one_inner(&resolver, &id, rel, target, true);
        Ok(())
    }

    /// Add `target` to a to-many relationship.
    #[tracing::instrument(level = "trace", skip(self), fields(context = %self.id))]
    pub fn add_to_many(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) -> Result<()> {
        self.change_to_many(id, relationship, target, true)
    }

    /// Remove `target` from a to-many relationship.
    #[tracing::instrument(level = "trace", skip(self), fields(context = %self.id))]
    pub fn remove_to_many(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) -> Result<()> {
        self.change_to_many(id, relationship, target, false)
    }

    fn change_to_many(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId, add: bool) -> Result<()> {
        self.sync_snapshot_events();
        let resolver = Arc::clone(&self.resolver);
        let rel = resolver.relationship(id.entity(), relationship)?;
        if !rel.to_many {
            return Err(unknown_property(format!(
                "'{}.{relationship}' is a to-one relationship",
                id.entity()
            )));
        }
        let id = self.writable(id)?;
        let target = self.linkable(target, rel)?;
        if rel.is_flattened() {
            self.change_flattened(&resolver, &id, rel, &target, add);
            return Ok(());
        }
        let reverse = resolver.reverse_of(rel).ok_or_else(|| {
            Error::Mapping(MappingError {
                entity: Some(rel.source.clone()),
                message: format!("to-many '{}' has no reverse relationship", rel.name),
            })
        })?;
        self.ensure_loaded(&target)?;
        if add {
            self.set_to_one_inner(&resolver, &target, reverse, Some(id), true);
            return Ok(());
        }
        match self.current_to_one(&target, reverse) {
            Some(Some(owner)) if owner != id => self.unlink_reverse(&resolver, &id, rel, &target),
            _ => self.set_to_one_inner(&resolver, &target, reverse, None, true),
        }
        Ok(())
    }

    pub(crate) fn set_to_one_inner(
        &mut self,
        resolver: &EntityResolver,
        id: &ObjectId,
        rel: &Relationship,
        target: Option<ObjectId>,
        maintain_reverse: bool,
    ) {
        let old = self.current_to_one(id, rel);
        if old.as_ref() == Some(&target) {
            if let Some(object) = self.store.node_mut(id) {
                object.to_one_mut().insert(rel.name.clone(), ToOne::Resolved(target));
            }
            return;
        }
        if let Some(object) = self.store.node_mut(id) {
            object
                .to_one_mut()
                .insert(rel.name.clone(), ToOne::Resolved(target.clone()));
        }
        if let Some(Some(previous)) = &old {
            self.log.record_arc_deleted(id, &rel.name, previous);
        }
        if let Some(t) = &target {
            self.log.record_arc_created(id, &rel.name, t);
        }
        self.mark_modified(id);

        if !maintain_reverse {
            return;
        }
        let Some(reverse) = resolver.reverse_of(rel) else {
            return;
        };
        if let Some(Some(previous)) = old {
            if self.store.contains(&previous) {
                self.unlink_reverse(resolver, &previous, reverse, id);
            }
        }
        if let Some(t) = target {
            self.link_reverse(resolver, &t, reverse, id);
        }
    }

    /// Remove `member` from `owner`'s side of a relationship.
    pub(crate) fn unlink_reverse(
        &mut self,
        resolver: &EntityResolver,
        owner: &ObjectId,
        rel: &Relationship,
        member: &ObjectId,
    ) {
        if rel.to_many {
            let changed = self
                .store
                .node_mut(owner)
                .and_then(|o| o.to_many_mut().get_mut(&rel.name))
                .is_some_and(|slot| slot.remove(member));
            if changed {
                self.log.record_arc_deleted(owner, &rel.name, member);
                self.mark_modified(owner);
            }
            return;
        }
        match self.current_to_one(owner, rel) {
            None => self.set_to_one_inner(resolver, owner, rel, None, false),
            Some(Some(current)) if current == *member => {
                self.set_to_one_inner(resolver, owner, rel, None, false);
            }
            Some(_) => {}
        }
    }

    /// Add `member` to `owner`'s side of a relationship.
    fn link_reverse(&mut self, resolver: &EntityResolver, owner: &ObjectId, rel: &Relationship, member: &ObjectId) {
        if rel.to_many {
            let key = rel
                .map_key
                .as_ref()
                .and_then(|k| self.store.node(member).and_then(|m| m.value(k).cloned()));
            let changed = self
                .store
                .node_mut(owner)
                .and_then(|o| o.to_many_mut().get_mut(&rel.name))
                .is_some_and(|slot| slot.add(member.clone(), key));
            if changed {
                self.log.record_arc_created(owner, &rel.name, member);
                self.mark_modified(owner);
            }
            return;
        }
        if let Some(Some(previous)) = self.current_to_one(owner, rel) {
            if previous != *member && self.store.contains(&previous) {
                if let Some(back) = resolver.reverse_of(rel) {
                    if self.current_to_one(&previous, back) == Some(Some(owner.clone())) {
                        self.set_to_one_inner(resolver, &previous, back, None, false);
                    }
                }
            }
        }
        self.set_to_one_inner(resolver, owner, rel, Some(member.clone()), false);
    }

    /// Add or remove a join row of a flattened relationship, in memory and
    /// in the change log.
    pub(crate) fn change_flattened(
        &mut self,
        resolver: &EntityResolver,
        id: &ObjectId,
        rel: &Relationship,
        target: &ObjectId,
        add: bool,
    ) {
        let changed = self
            .store
            .node_mut(id)
            .and_then(|o| o.to_many_mut().get_mut(&rel.name))
            .is_some_and(|slot| {
                if add {
                    slot.add(target.clone(), None)
                } else {
                    slot.remove(target)
                }
            });
        if !changed {
            return;
        }
        let reverse = resolver.reverse_of(rel);
        self.log.record_flattened(
            FlattenedChange {
                entity: rel.source.clone(),
                relationship: rel.name.clone(),
                source: id.clone(),
                target: target.clone(),
                created: add,
            },
            reverse.map(|r| (r.source.as_str(), r.name.as_str())),
        );
        if add {
            self.log.record_arc_created(id, &rel.name, target);
        } else {
            self.log.record_arc_deleted(id, &rel.name, target);
        }
        self.mark_modified(id);

        if let Some(reverse) = reverse {
            let changed = self
                .store
                .node_mut(target)
                .and_then(|o| o.to_many_mut().get_mut(&reverse.name))
                .is_some_and(|slot| {
                    if add {
                        slot.add(id.clone(), None)
                    } else {
                        slot.remove(id)
                    }
                });
            if changed {
                if add {
                    self.log.record_arc_created(target, &reverse.name, id);
                } else {
                    self.log.record_arc_deleted(target, &reverse.name, id);
                }
                self.mark_modified(target);
            }
        }
    }

    /// Discard every uncommitted change.
    ///
    /// NEW objects leave the context, MODIFIED and DELETED objects get their
    /// committed values back and their relationships turn into faults.
    #[tracing::instrument(level = "debug", skip(self), fields(context = %self.id))]
    pub fn rollback_changes(&mut self) {
        let diff = self.log.current_diff();
        diff.undo(&mut RollbackHandler {
            store: &mut self.store,
        });
        for id in self.store.ids_in_state(PersistenceState::New) {
            self.store.unregister(&id);
        }
        let mut restored = self.store.ids_in_state(PersistenceState::Modified);
        restored.extend(self.store.ids_in_state(PersistenceState::Deleted));
        for id in &restored {
            self.store.transition(id, PersistenceState::Committed);
            if let Some(object) = self.store.node_mut(id) {
                reset_relationships(object);
            }
            self.notify_lifecycle(LifecycleEvent::PostLoad, id);
        }
        self.log.reset();
        tracing::info!(restored = restored.len(), undone = diff.len(), "Rolled back changes");
    }

    /// Turn objects HOLLOW and drop their snapshots from the shared cache.
    ///
    /// Uncommitted changes of the invalidated objects are discarded.
    #[tracing::instrument(level = "debug", skip(self, ids), fields(context = %self.id))]
    pub fn invalidate_objects(&mut self, ids: &[ObjectId]) {
        let mut invalidated = Vec::new();
        for id in ids {
            let id = self.store.resolve_id(id);
            match self.state(&id) {
                PersistenceState::Committed
                | PersistenceState::Modified
                | PersistenceState::Deleted
                | PersistenceState::Hollow => {
                    if let Some(object) = self.store.node_mut(&id) {
                        object.make_hollow();
                    }
                    self.store.transition(&id, PersistenceState::Hollow);
                    self.log.forget(&id);
                    invalidated.push(id);
                }
                _ => {}
            }
        }
        if invalidated.is_empty() {
            return;
        }
        tracing::debug!(count = invalidated.len(), "Invalidated objects");
        self.cache.process_snapshot_changes(
            Some(self.id),
            SnapshotChanges {
                invalidated,
                ..SnapshotChanges::default()
            },
        );
    }

    /// Remove objects from the context. They become TRANSIENT.
    pub fn unregister_objects(&mut self, ids: &[ObjectId]) -> Vec<DataObject> {
        ids.iter()
            .filter_map(|id| {
                let id = self.store.resolve_id(id);
                self.log.forget(&id);
                self.store.unregister(&id)
            })
            .collect()
    }

    /// Register a HOLLOW copy of an object known by its permanent id,
    /// typically one fetched in another context. No query is run.
    pub fn local_object(&mut self, id: &ObjectId) -> Result<ObjectId> {
        if id.is_temporary() {
            return Err(Error::identity(
                IdentityErrorKind::TemporaryId,
                format!("{id} has no permanent id to localize"),
            ));
        }
        let resolver = Arc::clone(&self.resolver);
        let entity = resolver.entity(id.entity())?;
        if self.store.contains(id) {
            return Ok(self.store.resolve_id(id));
        }
        let mut object = DataObject::with_id(id.clone(), PersistenceState::Hollow);
        init_slots(entity, &mut object, false);
        self.store.insert(object);
        Ok(id.clone())
    }

    /// Apply snapshot events published by other contexts since the last
    /// call.
    pub fn sync_snapshot_events(&mut self) {
        let events = self.subscription.try_drain();
        if events.is_empty() {
            return;
        }
        let resolver = Arc::clone(&self.resolver);
        for event in events {
            tracing::debug!(
                context = %self.id,
                source = ?event.source,
                updated = event.updated.len(),
                deleted = event.deleted.len(),
                invalidated = event.invalidated.len(),
                "Applying snapshot event"
            );
            for (id, row) in &event.updated {
                if self.state(id) != PersistenceState::Committed {
                    continue;
                }
                if let Ok(entity) = resolver.entity(id.entity()) {
                    self.merge_row(entity, id, row.clone());
                }
            }
            for id in &event.deleted {
                match self.state(id) {
                    PersistenceState::Committed
                    | PersistenceState::Hollow
                    | PersistenceState::Deleted => {
                        self.log.forget(id);
                        self.store.unregister(id);
                    }
                    PersistenceState::Modified => {
                        self.store.transition(id, PersistenceState::New);
                    }
                    _ => {}
                }
            }
            for id in &event.invalidated {
                if self.state(id) == PersistenceState::Committed {
                    if let Some(object) = self.store.node_mut(id) {
                        object.make_hollow();
                    }
                    self.store.transition(id, PersistenceState::Hollow);
                }
            }
            for id in &event.indirectly_modified {
                if matches!(self.state(id), PersistenceState::Committed | PersistenceState::Hollow) {
                    if let Some(object) = self.store.node_mut(id) {
                        for slot in object.to_many_mut().values_mut() {
                            *slot = ToMany::fault(slot.kind());
                        }
                    }
                }
            }
        }
    }

    /// Encode every registered object in its detached form.
    pub fn serialize_graph(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.store.snapshot_objects())?)
    }
}

fn reset_relationships(object: &mut DataObject) {
    for slot in object.to_one_mut().values_mut() {
        *slot = ToOne::Fault;
    }
    for slot in object.to_many_mut().values_mut() {
        *slot = ToMany::fault(slot.kind());
    }
}

/// Replays undone diffs onto the identity map.
struct RollbackHandler<'a> {
    store: &'a mut ObjectStore,
}

impl RollbackHandler<'_> {
    fn reset_slot(&mut self, id: &ObjectId, relationship: &str) {
        let Some(object) = self.store.node_mut(id) else {
            return;
        };
        if let Some(slot) = object.to_one_mut().get_mut(relationship) {
            *slot = ToOne::Fault;
        }
        if let Some(slot) = object.to_many_mut().get_mut(relationship) {
            *slot = ToMany::fault(slot.kind());
        }
    }
}

impl GraphChangeHandler for RollbackHandler<'_> {
    fn node_created(&mut self, id: &ObjectId) {
        if self.store.node(id).map(DataObject::state) == Some(PersistenceState::Deleted) {
            self.store.transition(id, PersistenceState::Committed);
        }
    }

    fn node_removed(&mut self, id: &ObjectId) {
        if self.store.node(id).map(DataObject::state) == Some(PersistenceState::New) {
            self.store.unregister(id);
        }
    }

    fn node_id_changed(&mut self, _old: &ObjectId, _new: &ObjectId) {}

    fn property_changed(&mut self, id: &ObjectId, property: &str, _old: &Value, new: &Value) {
        if let Some(object) = self.store.node_mut(id) {
            object.values_mut().insert(property.to_string(), new.clone());
        }
    }

    fn arc_created(&mut self, id: &ObjectId, relationship: &str, _target: &ObjectId) {
        self.reset_slot(id, relationship);
    }

    fn arc_deleted(&mut self, id: &ObjectId, relationship: &str, _target: &ObjectId) {
        self.reset_slot(id, relationship);
    }
}

/// A context shared between threads.
///
/// Every access locks the whole context. [`serialize_graph`](Self::serialize_graph)
/// copies the registered objects under the lock and encodes the copy after
/// releasing it, so writers are blocked only for the copy.
pub struct SharedContext<N: DataNode> {
    inner: Arc<Mutex<ObjectContext<N>>>,
}

impl<N: DataNode> Clone for SharedContext<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N: DataNode> SharedContext<N> {
    pub fn new(context: ObjectContext<N>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    /// Lock the context. A poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<'_, ObjectContext<N>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the context.
    pub fn with<R>(&self, f: impl FnOnce(&mut ObjectContext<N>) -> R) -> R {
        f(&mut self.lock())
    }

    /// Copies of every registered object.
    pub fn snapshot_objects(&self) -> Vec<DataObject> {
        self.lock().store.snapshot_objects()
    }

    pub fn serialize_graph(&self) -> Result<Vec<u8>> {
        let objects = self.snapshot_objects();
        Ok(serde_json::to_vec(&objects)?)
    }
}
