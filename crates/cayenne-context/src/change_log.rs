//! Change recording for a context.
//!
//! The log keeps three things between commits:
//!
//! - the ordered [`GraphDiff`] sequence, handed out as [`CompoundDiff`]
//!   snapshots and replayed backwards on rollback,
//! - the original value of every changed column, which yields the minimal
//!   UPDATE column set and detects phantom modifications,
//! - pending join rows of flattened relationships, deduplicated so that an
//!   add followed by a remove of the same pair leaves nothing behind.

use cayenne_core::{CompoundDiff, GraphDiff, ObjectId, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A pending join row change of a flattened relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedChange {
    /// Entity declaring the relationship.
    pub entity: String,
    pub relationship: String,
    pub source: ObjectId,
    pub target: ObjectId,
    /// `true` for a join row insert, `false` for a delete.
    pub created: bool,
}

impl FlattenedChange {
    /// Whether `other` names the same join row.
    ///
    /// `reverse` is the `(entity, relationship)` pair of the reverse
    /// relationship, which addresses the row with source and target swapped.
    fn same_row(&self, other: &FlattenedChange, reverse: Option<(&str, &str)>) -> bool {
        let direct = self.entity == other.entity
            && self.relationship == other.relationship
            && self.source == other.source
            && self.target == other.target;
        let reversed = reverse.is_some_and(|(entity, relationship)| {
            other.entity == entity
                && other.relationship == relationship
                && other.source == self.target
                && other.target == self.source
        });
        direct || reversed
    }
}

/// Per-context change log.
#[derive(Debug, Default)]
pub struct ChangeLog {
    diffs: Vec<Arc<GraphDiff>>,
    originals: HashMap<ObjectId, BTreeMap<String, Value>>,
    flattened: Vec<FlattenedChange>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, diff: GraphDiff) {
        tracing::trace!(node = %diff.node(), "Recording graph diff");
        self.diffs.push(Arc::new(diff));
    }

    pub fn record_create(&mut self, id: &ObjectId) {
        self.push(GraphDiff::NodeCreated { id: id.clone() });
    }

    pub fn record_delete(&mut self, id: &ObjectId) {
        self.push(GraphDiff::NodeRemoved { id: id.clone() });
    }

    /// Record a column change. The first recorded old value of a column is
    /// kept as its original.
    pub fn record_property_change(&mut self, id: &ObjectId, property: &str, old: &Value, new: &Value) {
        self.originals
            .entry(id.clone())
            .or_default()
            .entry(property.to_string())
            .or_insert_with(|| old.clone());
        self.push(GraphDiff::PropertyChanged {
            id: id.clone(),
            property: property.to_string(),
            old: old.clone(),
            new: new.clone(),
        });
    }

    pub fn record_arc_created(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) {
        self.push(GraphDiff::ArcCreated {
            id: id.clone(),
            relationship: relationship.to_string(),
            target: target.clone(),
        });
    }

    pub fn record_arc_deleted(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId) {
        self.push(GraphDiff::ArcDeleted {
            id: id.clone(),
            relationship: relationship.to_string(),
            target: target.clone(),
        });
    }

    /// Record a join row change, cancelling out an opposite pending change
    /// of the same row. Returns `false` when the change was absorbed.
    pub fn record_flattened(&mut self, change: FlattenedChange, reverse: Option<(&str, &str)>) -> bool {
        if let Some(pos) = self
            .flattened
            .iter()
            .position(|pending| change.same_row(pending, reverse))
        {
            if self.flattened[pos].created != change.created {
                self.flattened.remove(pos);
                tracing::trace!(
                    relationship = %change.relationship,
                    "Join row change cancelled a pending one"
                );
            }
            return false;
        }
        self.flattened.push(change);
        true
    }

    /// Snapshot of the recorded diffs. Later recording or [`reset`](Self::reset)
    /// never alters a returned diff.
    pub fn current_diff(&self) -> CompoundDiff {
        CompoundDiff::new(self.diffs.clone())
    }

    pub fn flattened_changes(&self) -> &[FlattenedChange] {
        &self.flattened
    }

    /// Original values of the changed columns of an object.
    pub fn original_values(&self, id: &ObjectId) -> Option<&BTreeMap<String, Value>> {
        self.originals.get(id)
    }

    /// Columns whose current value differs from the original.
    pub fn changed_columns(&self, id: &ObjectId, current: &BTreeMap<String, Value>) -> Vec<String> {
        let Some(originals) = self.originals.get(id) else {
            return Vec::new();
        };
        originals
            .iter()
            .filter(|(column, original)| {
                let now = current.get(*column).unwrap_or(&Value::Null);
                !same_value(original, now)
            })
            .map(|(column, _)| column.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty() && self.flattened.is_empty()
    }

    /// Forget tracked originals of an object leaving the context.
    pub fn forget(&mut self, id: &ObjectId) {
        self.originals.remove(id);
        self.flattened
            .retain(|change| change.source != *id && change.target != *id);
    }

    /// Follow a commit-time id replacement.
    pub fn process_id_change(&mut self, old: &ObjectId, new: &ObjectId) {
        if let Some(originals) = self.originals.remove(old) {
            self.originals.insert(new.clone(), originals);
        }
        for change in &mut self.flattened {
            if change.source == *old {
                change.source = new.clone();
            }
            if change.target == *old {
                change.target = new.clone();
            }
        }
    }

    /// Clear everything recorded so far.
    pub fn reset(&mut self) {
        self.diffs.clear();
        self.originals.clear();
        self.flattened.clear();
    }
}

/// Value equality used for change detection: numeric width does not matter,
/// NULL equals NULL.
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    (a.is_null() && b.is_null()) || a.key_eq(b)
}
