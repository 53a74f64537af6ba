//! Lifecycle callbacks and commit listeners.
//!
//! Lifecycle callbacks are registered per entity and event. Callbacks of
//! `Pre*` events can veto the operation by returning `Err`; errors of
//! `Post*` callbacks are only logged.
//!
//! Commit listeners receive a [`CommitLog`] after every successful commit:
//! the committed diff plus one [`ObjectChange`] per inserted, updated or
//! deleted object.

use crate::change_log::same_value;
use crate::context::ObjectContext;
use crate::object::DataObject;
use crate::unit_of_work::CommitPlan;
use cayenne_core::{
    CompoundDiff, ContextId, DataNode, EntityResolver, FkSide, GraphDiff, ObjectId, Result,
    Value,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Object lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// A NEW object was registered. Returning `Err` rejects the registration.
    PrePersist,
    /// The object's row was inserted.
    PostPersist,
    /// A MODIFIED object is about to be committed. Returning `Err` aborts
    /// the commit.
    PreUpdate,
    /// The object's row was updated.
    PostUpdate,
    /// The object is about to be deleted. Returning `Err` aborts the delete.
    PreRemove,
    /// The object left the data node, or a deleted NEW object left the
    /// context.
    PostRemove,
    /// The object's values were read from a row, or restored by a rollback.
    PostLoad,
}

impl LifecycleEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::PrePersist => "pre-persist",
            LifecycleEvent::PostPersist => "post-persist",
            LifecycleEvent::PreUpdate => "pre-update",
            LifecycleEvent::PostUpdate => "post-update",
            LifecycleEvent::PreRemove => "pre-remove",
            LifecycleEvent::PostRemove => "post-remove",
            LifecycleEvent::PostLoad => "post-load",
        }
    }

    const fn can_veto(self) -> bool {
        matches!(
            self,
            LifecycleEvent::PrePersist | LifecycleEvent::PreUpdate | LifecycleEvent::PreRemove
        )
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of row change an object went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Committed old and new value of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    pub old: Value,
    pub new: Value,
}

/// Committed old and new target of one to-one relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct ToOneChange {
    pub old: Option<ObjectId>,
    pub new: Option<ObjectId>,
}

/// Members added to and removed from one to-many relationship.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToManyChange {
    pub added: Vec<ObjectId>,
    pub removed: Vec<ObjectId>,
}

impl ToManyChange {
    fn record(&mut self, target: &ObjectId, added: bool) {
        let (into, from) = if added {
            (&mut self.added, &mut self.removed)
        } else {
            (&mut self.removed, &mut self.added)
        };
        if let Some(pos) = from.iter().position(|t| t == target) {
            from.remove(pos);
        } else if !into.contains(target) {
            into.push(target.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Everything one commit changed about one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectChange {
    pub kind: ChangeKind,
    /// Id the object had while the changes were made.
    pub pre_commit_id: ObjectId,
    /// Id after the commit; the permanent id for inserts.
    pub post_commit_id: ObjectId,
    pub attributes: BTreeMap<String, AttributeChange>,
    pub to_one: BTreeMap<String, ToOneChange>,
    pub to_many: BTreeMap<String, ToManyChange>,
}

impl ObjectChange {
    fn new(kind: ChangeKind, id: &ObjectId) -> Self {
        Self {
            kind,
            pre_commit_id: id.clone(),
            post_commit_id: id.clone(),
            attributes: BTreeMap::new(),
            to_one: BTreeMap::new(),
            to_many: BTreeMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.to_one.is_empty() && self.to_many.is_empty()
    }

    fn property(&mut self, property: &str, old: &Value, new: &Value) {
        self.attributes
            .entry(property.to_string())
            .and_modify(|change| change.new = new.clone())
            .or_insert_with(|| AttributeChange {
                old: old.clone(),
                new: new.clone(),
            });
    }

    fn arc(&mut self, relationship: &str, target: &ObjectId, to_many: bool, created: bool) {
        if to_many {
            self.to_many
                .entry(relationship.to_string())
                .or_default()
                .record(target, created);
            return;
        }
        let new = created.then(|| target.clone());
        self.to_one
            .entry(relationship.to_string())
            .and_modify(|change| change.new.clone_from(&new))
            .or_insert_with(|| ToOneChange {
                old: (!created).then(|| target.clone()),
                new,
            });
    }

    fn drop_noops(&mut self) {
        self.attributes.retain(|_, c| !same_value(&c.old, &c.new));
        self.to_one.retain(|_, c| c.old != c.new);
        self.to_many.retain(|_, c| !c.is_empty());
    }
}

/// What a successful commit changed, handed to commit listeners.
#[derive(Debug, Clone)]
pub struct CommitLog {
    pub context: ContextId,
    /// Every diff recorded since the previous commit, with pre-commit ids.
    pub diff: CompoundDiff,
    pub changes: Vec<ObjectChange>,
}

impl CommitLog {
    /// Change of an object, looked up by its pre- or post-commit id.
    pub fn change(&self, id: &ObjectId) -> Option<&ObjectChange> {
        self.changes
            .iter()
            .find(|c| c.pre_commit_id == *id || c.post_commit_id == *id)
    }

    pub fn changes_of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &ObjectChange> {
        self.changes.iter().filter(move |c| c.kind == kind)
    }
}

type LifecycleFn = Box<dyn FnMut(&DataObject) -> Result<()> + Send>;
type CommitListenerFn = Box<dyn FnMut(&CommitLog) -> Result<()> + Send>;

/// Callbacks registered on a context.
#[derive(Default)]
pub struct ContextCallbacks {
    lifecycle: HashMap<(LifecycleEvent, String), Vec<LifecycleFn>>,
    commit: Vec<CommitListenerFn>,
}

impl fmt::Debug for ContextCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCallbacks")
            .field("lifecycle", &self.lifecycle.values().map(Vec::len).sum::<usize>())
            .field("commit", &self.commit.len())
            .finish()
    }
}

impl ContextCallbacks {
    pub(crate) fn listens(&self, event: LifecycleEvent) -> bool {
        self.lifecycle.keys().any(|(e, _)| *e == event)
    }

    pub(crate) fn has_commit_listeners(&self) -> bool {
        !self.commit.is_empty()
    }

    fn fire(&mut self, event: LifecycleEvent, object: &DataObject) -> Result<()> {
        let Some(callbacks) = self.lifecycle.get_mut(&(event, object.entity().to_string())) else {
            return Ok(());
        };
        for cb in callbacks.iter_mut() {
            cb(object)?;
        }
        Ok(())
    }

    fn fire_commit(&mut self, log: &CommitLog) {
        for cb in &mut self.commit {
            if let Err(e) = cb(log) {
                tracing::warn!(context = %log.context, error = %e, "Commit listener failed");
            }
        }
    }
}

impl<N: DataNode> ObjectContext<N> {
    /// Register a callback for a lifecycle event of one entity.
    pub fn on_lifecycle(
        &mut self,
        event: LifecycleEvent,
        entity: &str,
        f: impl FnMut(&DataObject) -> Result<()> + Send + 'static,
    ) {
        self.callbacks
            .lifecycle
            .entry((event, entity.to_string()))
            .or_default()
            .push(Box::new(f));
    }

    /// Register a listener called after every successful commit.
    pub fn on_post_commit(&mut self, f: impl FnMut(&CommitLog) -> Result<()> + Send + 'static) {
        self.callbacks.commit.push(Box::new(f));
    }

    pub fn callbacks(&self) -> &ContextCallbacks {
        &self.callbacks
    }

    /// Run the callbacks of a vetoing event. Unknown ids pass.
    pub(crate) fn fire_lifecycle(&mut self, event: LifecycleEvent, id: &ObjectId) -> Result<()> {
        debug_assert!(event.can_veto());
        let Some(object) = self.store.node(id) else {
            return Ok(());
        };
        self.callbacks.fire(event, object).map_err(|e| {
            tracing::debug!(object = %id, %event, error = %e, "Lifecycle callback vetoed");
            e
        })
    }

    /// Run the callbacks of an event that already happened.
    pub(crate) fn notify_lifecycle(&mut self, event: LifecycleEvent, id: &ObjectId) {
        if let Some(object) = self.store.node(id) {
            report(event, id, self.callbacks.fire(event, object));
        }
    }

    /// Like [`notify_lifecycle`](Self::notify_lifecycle), for an object that
    /// is no longer registered.
    pub(crate) fn notify_detached(&mut self, event: LifecycleEvent, object: &DataObject) {
        report(event, object.id(), self.callbacks.fire(event, object));
    }

    pub(crate) fn notify_commit(&mut self, log: &CommitLog) {
        self.callbacks.fire_commit(log);
    }
}

fn report(event: LifecycleEvent, id: &ObjectId, result: Result<()>) {
    if let Err(e) = result {
        tracing::warn!(object = %id, %event, error = %e, "Lifecycle callback failed");
    }
}

/// Collects the per-object changes of a commit before it is applied.
///
/// Deleted objects are captured in full here because applying the commit
/// unregisters them; inserted objects get their values in
/// [`finish`](Self::finish) once keys are generated.
pub(crate) struct CommitLogBuilder {
    log: CommitLog,
}

impl CommitLogBuilder {
    pub(crate) fn collect<N: DataNode>(context: &ObjectContext<N>, plan: &CommitPlan) -> Self {
        let resolver = context.resolver().as_ref();
        let diff = context.log.current_diff();
        let mut changes: Vec<ObjectChange> = Vec::new();
        let mut index: HashMap<ObjectId, usize> = HashMap::new();
        let kinds = plan
            .inserted
            .iter()
            .map(|id| (id, ChangeKind::Insert))
            .chain(plan.updated.iter().chain(&plan.unchanged).map(|id| (id, ChangeKind::Update)))
            .chain(plan.deleted.iter().map(|id| (id, ChangeKind::Delete)));
        for (id, kind) in kinds {
            index.entry(id.clone()).or_insert_with(|| {
                changes.push(ObjectChange::new(kind, id));
                changes.len() - 1
            });
        }

        for d in diff.diffs() {
            let Some(change) = index.get(d.node()).and_then(|i| changes.get_mut(*i)) else {
                continue;
            };
            match d {
                GraphDiff::PropertyChanged {
                    property, old, new, ..
                } => change.property(property, old, new),
                GraphDiff::ArcCreated {
                    id,
                    relationship,
                    target,
                }
                | GraphDiff::ArcDeleted {
                    id,
                    relationship,
                    target,
                } => {
                    let Ok(rel) = resolver.relationship(id.entity(), relationship) else {
                        continue;
                    };
                    let created = matches!(d, GraphDiff::ArcCreated { .. });
                    change.arc(relationship, target, rel.to_many, created);
                }
                GraphDiff::NodeCreated { .. }
                | GraphDiff::NodeRemoved { .. }
                | GraphDiff::NodeIdChanged { .. } => {}
            }
        }

        for change in &mut changes {
            if change.kind == ChangeKind::Delete {
                capture_deleted(context, resolver, change);
            }
            change.drop_noops();
        }
        changes.retain(|c| c.kind != ChangeKind::Update || !c.is_empty());

        Self {
            log: CommitLog {
                context: context.id(),
                diff,
                changes,
            },
        }
    }

    /// Fill in post-commit ids and the inserted values.
    pub(crate) fn finish<N: DataNode>(mut self, context: &ObjectContext<N>) -> CommitLog {
        for change in &mut self.log.changes {
            if change.kind == ChangeKind::Delete {
                continue;
            }
            change.post_commit_id = context.object_store().resolve_id(&change.pre_commit_id);
            if change.kind != ChangeKind::Insert {
                continue;
            }
            let Some(object) = context.node(&change.post_commit_id) else {
                continue;
            };
            for (column, value) in object.values() {
                if value.is_null() {
                    continue;
                }
                change
                    .attributes
                    .entry(column.clone())
                    .and_modify(|c| c.new = value.clone())
                    .or_insert_with(|| AttributeChange {
                        old: Value::Null,
                        new: value.clone(),
                    });
            }
            change.attributes.values_mut().for_each(|c| c.old = Value::Null);
            change.drop_noops();
        }
        self.log
    }
}

/// Every value and source-side to-one target of a deleted object goes to
/// NULL.
fn capture_deleted<N: DataNode>(context: &ObjectContext<N>, resolver: &EntityResolver, change: &mut ObjectChange) {
    let id = &change.pre_commit_id;
    let Some(object) = context.node(id) else {
        return;
    };
    let originals = context.log.original_values(id);
    for (column, value) in object.values() {
        let old = originals.and_then(|o| o.get(column)).unwrap_or(value);
        change.attributes.insert(
            column.clone(),
            AttributeChange {
                old: old.clone(),
                new: Value::Null,
            },
        );
    }
    let Ok(entity) = resolver.entity(id.entity()) else {
        return;
    };
    for rel in entity
        .relationships()
        .iter()
        .filter(|rel| !rel.to_many && rel.fk_side() == FkSide::Source)
    {
        let old = change
            .to_one
            .get(&rel.name)
            .map_or_else(|| context.fk_target(object, rel), |c| c.old.clone());
        if old.is_some() {
            change.to_one.insert(rel.name.clone(), ToOneChange { old, new: None });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn painting(n: i64) -> ObjectId {
        ObjectId::single("Painting", "id", n)
    }

    #[test]
    fn to_many_change_cancels_opposite_arcs() {
        let mut change = ToManyChange::default();
        change.record(&painting(1), true);
        change.record(&painting(2), true);
        change.record(&painting(1), false);
        change.record(&painting(3), false);
        assert_eq!(change.added, vec![painting(2)]);
        assert_eq!(change.removed, vec![painting(3)]);
    }

    #[test]
    fn to_one_change_keeps_first_old_target() {
        let artist = ObjectId::single("Artist", "id", 9_i64);
        let mut change = ObjectChange::new(ChangeKind::Update, &painting(1));
        change.arc("artist", &artist, false, false);
        let other = ObjectId::single("Artist", "id", 5_i64);
        let last = ObjectId::single("Artist", "id", 6_i64);
        change.arc("artist", &other, false, true);
        change.arc("artist", &other, false, false);
        change.arc("artist", &last, false, true);
        let to_one = &change.to_one["artist"];
        assert_eq!(to_one.old, Some(artist));
        assert_eq!(to_one.new, Some(last));
    }

    #[test]
    fn reverted_values_are_dropped() {
        let mut change = ObjectChange::new(ChangeKind::Update, &painting(1));
        change.property("title", &Value::from("a"), &Value::from("b"));
        change.property("title", &Value::from("b"), &Value::from("a"));
        change.arc("artist", &painting(2), false, true);
        change.arc("artist", &painting(2), false, false);
        change.drop_noops();
        assert!(change.is_empty());
    }

    #[test]
    fn debug_prints_counts() {
        let mut callbacks = ContextCallbacks::default();
        callbacks
            .lifecycle
            .entry((LifecycleEvent::PostLoad, "Artist".into()))
            .or_default()
            .push(Box::new(|_| Ok(())));
        callbacks.commit.push(Box::new(|_| Ok(())));
        assert_eq!(
            format!("{callbacks:?}"),
            "ContextCallbacks { lifecycle: 1, commit: 1 }"
        );
        assert!(callbacks.listens(LifecycleEvent::PostLoad));
        assert!(!callbacks.listens(LifecycleEvent::PreUpdate));
    }
}
