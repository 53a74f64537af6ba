//! Child contexts.
//!
//! A child context shares the data node, resolver and snapshot cache of its
//! parent but keeps its own identity map and change log. Its changes reach
//! the parent only through [`ObjectContext::commit_changes_to_parent`], which
//! replays the child's recorded diff onto the parent's graph. The parent then
//! commits them to the data node like its own changes.

use crate::change_log::{ChangeLog, same_value};
use crate::context::{ObjectContext, init_slots};
use crate::flush::CommitReport;
use crate::object::DataObject;
use crate::object_store::ObjectStore;
use cayenne_core::{
    ContextId, Cx, DataNode, EntityResolver, Error, GraphChangeHandler, GraphDiff,
    IdentityErrorKind, ObjectId, Outcome, PersistenceState, Result, Value,
};
use std::sync::Arc;

fn invalid_state(message: impl Into<String>) -> Error {
    Error::identity(IdentityErrorKind::InvalidState, message)
}

impl<N: DataNode> ObjectContext<N> {
    /// Create a child context of this one.
    pub fn child_context(&self) -> ObjectContext<N> {
        let mut child = ObjectContext::new(
            Arc::clone(self.data_node()),
            Arc::clone(self.resolver()),
            Arc::clone(self.cache()),
            self.config().clone(),
        );
        child.parent = Some(self.id());
        tracing::debug!(context = %child.id(), parent = %self.id(), "Child context created");
        child
    }

    /// Id of the context this one commits into, if it is a child.
    pub fn parent_id(&self) -> Option<ContextId> {
        self.parent
    }

    fn check_parent(&self, parent: &ObjectContext<N>) -> Result<()> {
        if self.parent == Some(parent.id()) {
            return Ok(());
        }
        Err(Error::identity(
            IdentityErrorKind::ForeignContext,
            format!("{} is not the parent of {}", parent.id(), self.id()),
        ))
    }

    /// Copy an object of the parent into this child as COMMITTED.
    ///
    /// NEW parent objects keep their temporary id and resolved to-one
    /// targets. HOLLOW parent objects are registered HOLLOW.
    pub fn local_object_from_parent(&mut self, parent: &ObjectContext<N>, id: &ObjectId) -> Result<ObjectId> {
        self.check_parent(parent)?;
        let source = parent.store.require(id)?;
        if self.store.contains(source.id()) {
            return Ok(self.store.resolve_id(source.id()));
        }
        match source.state() {
            PersistenceState::Deleted => {
                return Err(invalid_state(format!("{} is deleted in the parent", source.id())));
            }
            PersistenceState::Hollow => return self.local_object(source.id()),
            _ => {}
        }
        let resolver = Arc::clone(self.resolver());
        let entity = resolver.entity(source.entity())?;
        let mut object = DataObject::with_id(source.id().clone(), PersistenceState::Committed);
        *object.values_mut() = source.values().clone();
        object.set_snapshot_version(source.snapshot_version());
        if source.state() == PersistenceState::New {
            for rel in entity.relationships().iter().filter(|rel| !rel.to_many) {
                if let Some(slot) = source.to_one(&rel.name) {
                    object.to_one_mut().insert(rel.name.clone(), slot.clone());
                }
            }
        }
        init_slots(entity, &mut object, false);
        let id = object.id().clone();
        self.store.insert(object);
        Ok(id)
    }

    /// Replay every change of this child onto its parent.
    ///
    /// The parent records the changes as its own and commits them on its
    /// next [`commit_changes`](Self::commit_changes). Afterwards the child's
    /// NEW and MODIFIED objects are COMMITTED, its DELETED objects are gone
    /// and its change log is empty. Nothing changes when an object was
    /// deleted in the parent meanwhile.
    #[tracing::instrument(level = "debug", skip(self, parent), fields(context = %self.id(), parent = %parent.id()))]
    pub fn commit_changes_to_parent(&mut self, parent: &mut ObjectContext<N>) -> Result<()> {
        self.check_parent(parent)?;
        self.sync_snapshot_events();
        let diff = self.log.current_diff();
        if let Some(id) = diff
            .diffs()
            .map(GraphDiff::node)
            .find(|id| parent.state(id) == PersistenceState::Deleted)
        {
            return Err(invalid_state(format!("{id} is deleted in the parent")));
        }

        let resolver = Arc::clone(self.resolver());
        let mut replay = ParentReplay {
            parent: &mut *parent,
            child: &self.store,
            child_log: &self.log,
            resolver: Arc::clone(&resolver),
            error: None,
        };
        diff.apply(&mut replay);
        if let Some(e) = replay.error {
            tracing::warn!(error = %e, "Replaying child changes failed");
            return Err(e);
        }
        for change in self.log.flattened_changes() {
            let reverse = resolver
                .relationship(&change.entity, &change.relationship)
                .ok()
                .and_then(|rel| resolver.reverse_of(rel));
            parent.log.record_flattened(
                change.clone(),
                reverse.map(|r| (r.source.as_str(), r.name.as_str())),
            );
        }

        for id in self.store.ids_in_state(PersistenceState::Deleted) {
            self.store.unregister(&id);
        }
        let mut committed = self.store.ids_in_state(PersistenceState::New);
        committed.extend(self.store.ids_in_state(PersistenceState::Modified));
        for id in &committed {
            self.store.transition(id, PersistenceState::Committed);
        }
        self.log.reset();
        tracing::info!(replayed = diff.len(), objects = committed.len(), "Committed changes to parent");
        Ok(())
    }

    /// Commit this child into its parent and the parent into the data node.
    ///
    /// Objects the child created get the permanent ids generated by the
    /// parent's commit.
    pub async fn commit_changes_through_parent(
        &mut self,
        cx: &Cx,
        parent: &mut ObjectContext<N>,
    ) -> Outcome<CommitReport, Error> {
        try_result!(self.commit_changes_to_parent(parent));
        let report = try_outcome!(parent.commit_changes(cx).await);
        self.adopt_replacement_ids();
        Outcome::Ok(report)
    }

    /// Re-key objects whose temporary id was replaced by a commit of
    /// another context.
    fn adopt_replacement_ids(&mut self) {
        let replaced: Vec<(ObjectId, ObjectId)> = self
            .store
            .ids()
            .filter(|id| id.is_temporary() && id.has_replacement_id())
            .filter_map(|id| id.create_replacement_id().ok().map(|new| (id.clone(), new)))
            .collect();
        for (old, new) in replaced {
            if let (Some(object), Some(key)) = (self.store.node_mut(&old), new.id_snapshot()) {
                object.values_mut().extend(key.clone());
            }
            self.store.process_id_change(&old, &new);
            self.log.process_id_change(&old, &new);
            tracing::trace!(old = %old, new = %new, "Adopted permanent id from parent commit");
        }
    }
}

/// Replays a child's diff onto the parent graph.
struct ParentReplay<'a, N: DataNode> {
    parent: &'a mut ObjectContext<N>,
    child: &'a ObjectStore,
    child_log: &'a ChangeLog,
    resolver: Arc<EntityResolver>,
    error: Option<Error>,
}

impl<N: DataNode> ParentReplay<'_, N> {
    fn fail(&mut self, e: Error) {
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    /// Make an object changeable in the parent. Temporary ids the parent
    /// does not know belong to objects created and deleted in the child.
    fn prepare(&mut self, id: &ObjectId) -> bool {
        if self.error.is_some() {
            return false;
        }
        match self.parent.state(id) {
            PersistenceState::New | PersistenceState::Committed | PersistenceState::Modified => true,
            PersistenceState::Deleted => {
                self.fail(invalid_state(format!("{id} is deleted in the parent")));
                false
            }
            PersistenceState::Hollow => self.parent.ensure_loaded(id).is_ok() || self.adopt(id),
            PersistenceState::Transient => !id.is_temporary() && self.adopt(id),
        }
    }

    /// Register the committed state of a child object in the parent.
    fn adopt(&mut self, id: &ObjectId) -> bool {
        let child = self.child;
        let Some(source) = child.node(id) else {
            self.fail(Error::identity(
                IdentityErrorKind::NotRegistered,
                format!("{id} is registered in neither context"),
            ));
            return false;
        };
        let resolver = Arc::clone(&self.resolver);
        let entity = match resolver.entity(id.entity()) {
            Ok(entity) => entity,
            Err(e) => {
                self.fail(e);
                return false;
            }
        };
        let mut object = DataObject::with_id(source.id().clone(), PersistenceState::Committed);
        *object.values_mut() = source.values().clone();
        if let Some(originals) = self.child_log.original_values(id) {
            object.values_mut().extend(originals.clone());
        }
        object.set_snapshot_version(source.snapshot_version());
        init_slots(entity, &mut object, false);
        self.parent.store.insert(object);
        tracing::trace!(object = %id, "Adopted child object into parent");
        true
    }

    fn arc(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId, created: bool) {
        if !self.prepare(id) {
            return;
        }
        let resolver = Arc::clone(&self.resolver);
        let rel = match resolver.relationship(id.entity(), relationship) {
            Ok(rel) => rel,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        if created && !self.parent.store.contains(target) {
            if target.is_temporary() {
                return;
            }
            if let Err(e) = self.parent.local_object(target) {
                self.fail(e);
                return;
            }
        }
        if !rel.to_many {
            let target = created.then(|| target.clone());
            self.parent.set_to_one_inner(&resolver, id, rel, target, false);
            return;
        }
        let key = rel
            .map_key
            .as_ref()
            .and_then(|k| self.parent.store.node(target).and_then(|m| m.value(k).cloned()));
        let changed = self
            .parent
            .store
            .node_mut(id)
            .and_then(|o| o.to_many_mut().get_mut(&rel.name))
            .is_some_and(|slot| {
                if created {
                    slot.add(target.clone(), key)
                } else {
                    slot.remove(target)
                }
            });
        if !changed {
            return;
        }
        if created {
            self.parent.log.record_arc_created(id, &rel.name, target);
        } else {
            self.parent.log.record_arc_deleted(id, &rel.name, target);
        }
        self.parent.mark_modified(id);
    }
}

impl<N: DataNode> GraphChangeHandler for ParentReplay<'_, N> {
    fn node_created(&mut self, id: &ObjectId) {
        if self.error.is_some() || self.parent.store.contains(id) {
            return;
        }
        let resolver = Arc::clone(&self.resolver);
        let entity = match resolver.entity(id.entity()) {
            Ok(entity) => entity,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let mut object = DataObject::with_id(id.clone(), PersistenceState::Transient);
        if let Some(source) = self.child.node(id) {
            *object.values_mut() = source.values().clone();
        }
        init_slots(entity, &mut object, true);
        match self.parent.store.register_new(object) {
            Ok(id) => self.parent.log.record_create(&id),
            Err(e) => self.fail(e),
        }
    }

    fn node_removed(&mut self, id: &ObjectId) {
        if self.error.is_some() {
            return;
        }
        match self.parent.state(id) {
            PersistenceState::New => {
                self.parent.log.record_delete(id);
                self.parent.store.unregister(id);
                self.parent.release_references(id);
            }
            PersistenceState::Transient if id.is_temporary() => {}
            _ => {
                if self.prepare(id) {
                    self.parent.log.record_delete(id);
                    self.parent.store.transition(id, PersistenceState::Deleted);
                }
            }
        }
    }

    fn node_id_changed(&mut self, _old: &ObjectId, _new: &ObjectId) {}

    fn property_changed(&mut self, id: &ObjectId, property: &str, _old: &Value, new: &Value) {
        if !self.prepare(id) {
            return;
        }
        let Some(object) = self.parent.store.node_mut(id) else {
            return;
        };
        let old = object.value(property).cloned().unwrap_or(Value::Null);
        if same_value(&old, new) {
            return;
        }
        object.values_mut().insert(property.to_string(), new.clone());
        self.parent.log.record_property_change(id, property, &old, new);
        self.parent.mark_modified(id);
    }

    fn arc_created(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) {
        self.arc(id, relationship, target, true);
    }

    fn arc_deleted(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) {
        self.arc(id, relationship, target, false);
    }
}
