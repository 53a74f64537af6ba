//! Object deletion with relationship delete rules.
//!
//! Deletion runs in two phases. The first walks the cascade graph, reading
//! every relationship a rule needs and refusing the whole delete if a `Deny`
//! rule finds related objects. The second applies nullifications and marks
//! the objects DELETED; nothing is changed when the first phase fails or a
//! `PreRemove` callback vetoes.

use crate::callbacks::LifecycleEvent;
use crate::context::ObjectContext;
use cayenne_core::{
    Cx, DataNode, DeleteDeniedError, DeleteRule, Error, FkSide, ObjectId, Outcome,
    PersistenceState, Relationship, ToOne,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

impl<N: DataNode> ObjectContext<N> {
    /// Delete one object.
    pub async fn delete_object(&mut self, cx: &Cx, id: &ObjectId) -> Outcome<(), Error> {
        self.delete_objects(cx, std::slice::from_ref(id)).await
    }

    /// Delete objects and everything their `Cascade` rules reach.
    ///
    /// NEW objects leave the context at once; other objects become DELETED
    /// and their rows are removed on commit. Deleting a DELETED object does
    /// nothing.
    #[tracing::instrument(level = "debug", skip(self, cx, ids), fields(context = %self.id(), count = ids.len()))]
    pub async fn delete_objects(&mut self, cx: &Cx, ids: &[ObjectId]) -> Outcome<(), Error> {
        self.sync_snapshot_events();
        let resolver = Arc::clone(self.resolver());

        let mut queue = VecDeque::with_capacity(ids.len());
        for id in ids {
            let object = try_result!(self.store.require(id));
            if object.state() != PersistenceState::Deleted {
                queue.push_back(object.id().clone());
            }
        }

        let mut seen = HashSet::new();
        let mut pending: Vec<(ObjectId, Vec<(&Relationship, Vec<ObjectId>)>)> = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) || self.state(&id) == PersistenceState::Deleted {
                continue;
            }
            let entity = try_result!(resolver.entity(id.entity()));
            let mut related = Vec::new();
            for rel in entity.relationships() {
                if rel.delete_rule == DeleteRule::NoAction && !rel.is_flattened() {
                    continue;
                }
                let members: Vec<ObjectId> = if rel.to_many {
                    try_outcome!(self.read_to_many(cx, &id, &rel.name).await)
                } else {
                    try_outcome!(self.read_to_one(cx, &id, &rel.name).await)
                        .into_iter()
                        .collect()
                };
                match rel.delete_rule {
                    DeleteRule::Deny if !members.is_empty() => {
                        tracing::debug!(object = %id, relationship = %rel.name, "Delete denied");
                        return Outcome::Err(Error::DeleteDenied(DeleteDeniedError {
                            object: id.to_string(),
                            relationship: rel.name.clone(),
                        }));
                    }
                    DeleteRule::Cascade => queue.extend(members.iter().cloned()),
                    DeleteRule::Nullify if holds_reverse_key(rel) => {
                        for member in &members {
                            try_result!(self.ensure_loaded(member));
                        }
                    }
                    _ => {}
                }
                related.push((rel, members));
            }
            pending.push((id, related));
        }

        for (id, _) in &pending {
            try_result!(self.fire_lifecycle(LifecycleEvent::PreRemove, id));
        }

        for (id, related) in pending {
            for (rel, members) in related {
                if rel.is_flattened() {
                    for member in &members {
                        self.change_flattened(&resolver, &id, rel, member, false);
                    }
                    continue;
                }
                if rel.delete_rule != DeleteRule::Nullify {
                    continue;
                }
                let Some(reverse) = resolver.reverse_of(rel) else {
                    continue;
                };
                for member in &members {
                    if !self.store.contains(member) || self.state(member) == PersistenceState::Deleted {
                        continue;
                    }
                    if holds_reverse_key(rel) {
                        self.set_to_one_inner(&resolver, member, reverse, None, false);
                    } else {
                        self.unlink_reverse(&resolver, member, reverse, &id);
                    }
                }
            }
            self.log.record_delete(&id);
            if self.state(&id) == PersistenceState::New {
                let removed = self.store.unregister(&id);
                self.release_references(&id);
                tracing::trace!(object = %id, "Unregistered deleted NEW object");
                if let Some(object) = removed {
                    self.notify_detached(LifecycleEvent::PostRemove, &object);
                }
            } else {
                try_result!(self.store.set_state(&id, PersistenceState::Deleted));
                tracing::trace!(object = %id, "Marked object DELETED");
            }
        }
        Outcome::Ok(())
    }
}

impl<N: DataNode> ObjectContext<N> {
    /// Clear the slots still pointing at an object that left the context
    /// before it had a row. One-way relationships are only reachable here.
    pub(crate) fn release_references(&mut self, removed: &ObjectId) {
        let holders: Vec<(ObjectId, Vec<String>, Vec<String>)> = self
            .store
            .objects()
            .filter_map(|object| {
                let (to_one, to_many) = object.slots_referencing(removed);
                (!to_one.is_empty() || !to_many.is_empty())
                    .then(|| (object.id().clone(), to_one, to_many))
            })
            .collect();
        for (holder, to_one, to_many) in holders {
            if let Some(object) = self.store.node_mut(&holder) {
                for name in &to_one {
                    object.to_one_mut().insert(name.clone(), ToOne::Resolved(None));
                }
                for name in &to_many {
                    if let Some(slot) = object.to_many_mut().get_mut(name) {
                        slot.remove(removed);
                    }
                }
            }
            for name in to_one.iter().chain(&to_many) {
                self.log.record_arc_deleted(&holder, name, removed);
            }
            self.mark_modified(&holder);
            tracing::trace!(holder = %holder, object = %removed, "Released reference to deleted NEW object");
        }
        self.log.forget(removed);
    }
}

/// Whether the related objects hold the foreign key back to the source.
fn holds_reverse_key(rel: &Relationship) -> bool {
    !rel.is_flattened() && (rel.to_many || rel.fk_side() == FkSide::Target)
}
