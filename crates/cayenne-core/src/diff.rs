//! Graph diffs.
//!
//! Every mutation of a context's object graph is recorded as one immutable
//! [`GraphDiff`]. A [`CompoundDiff`] is a snapshot of the recorded sequence:
//! clearing the recorder afterwards never changes a compound diff that was
//! already handed out.

use crate::object_id::ObjectId;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One recorded graph mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphDiff {
    NodeCreated {
        id: ObjectId,
    },
    NodeRemoved {
        id: ObjectId,
    },
    NodeIdChanged {
        old: ObjectId,
        new: ObjectId,
    },
    PropertyChanged {
        id: ObjectId,
        property: String,
        old: Value,
        new: Value,
    },
    ArcCreated {
        id: ObjectId,
        relationship: String,
        target: ObjectId,
    },
    ArcDeleted {
        id: ObjectId,
        relationship: String,
        target: ObjectId,
    },
}

/// Receiver of replayed diffs.
pub trait GraphChangeHandler {
    fn node_created(&mut self, id: &ObjectId);
    fn node_removed(&mut self, id: &ObjectId);
    fn node_id_changed(&mut self, old: &ObjectId, new: &ObjectId);
    fn property_changed(&mut self, id: &ObjectId, property: &str, old: &Value, new: &Value);
    fn arc_created(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId);
    fn arc_deleted(&mut self, id: &ObjectId, relationship: &str, target: &ObjectId);
}

impl GraphDiff {
    /// The object this diff is about.
    pub fn node(&self) -> &ObjectId {
        match self {
            GraphDiff::NodeCreated { id }
            | GraphDiff::NodeRemoved { id }
            | GraphDiff::PropertyChanged { id, .. }
            | GraphDiff::ArcCreated { id, .. }
            | GraphDiff::ArcDeleted { id, .. } => id,
            GraphDiff::NodeIdChanged { old, .. } => old,
        }
    }

    /// Replay the mutation.
    pub fn apply(&self, handler: &mut impl GraphChangeHandler) {
        match self {
            GraphDiff::NodeCreated { id } => handler.node_created(id),
            GraphDiff::NodeRemoved { id } => handler.node_removed(id),
            GraphDiff::NodeIdChanged { old, new } => handler.node_id_changed(old, new),
            GraphDiff::PropertyChanged {
                id,
                property,
                old,
                new,
            } => handler.property_changed(id, property, old, new),
            GraphDiff::ArcCreated {
                id,
                relationship,
                target,
            } => handler.arc_created(id, relationship, target),
            GraphDiff::ArcDeleted {
                id,
                relationship,
                target,
            } => handler.arc_deleted(id, relationship, target),
        }
    }

    /// Replay the inverse mutation.
    pub fn undo(&self, handler: &mut impl GraphChangeHandler) {
        match self {
            GraphDiff::NodeCreated { id } => handler.node_removed(id),
            GraphDiff::NodeRemoved { id } => handler.node_created(id),
            GraphDiff::NodeIdChanged { old, new } => handler.node_id_changed(new, old),
            GraphDiff::PropertyChanged {
                id,
                property,
                old,
                new,
            } => handler.property_changed(id, property, new, old),
            GraphDiff::ArcCreated {
                id,
                relationship,
                target,
            } => handler.arc_deleted(id, relationship, target),
            GraphDiff::ArcDeleted {
                id,
                relationship,
                target,
            } => handler.arc_created(id, relationship, target),
        }
    }
}

/// Immutable, ordered snapshot of recorded diffs.
#[derive(Debug, Clone, Default)]
pub struct CompoundDiff {
    diffs: Vec<Arc<GraphDiff>>,
}

impl CompoundDiff {
    pub fn new(diffs: Vec<Arc<GraphDiff>>) -> Self {
        Self { diffs }
    }

    pub fn diffs(&self) -> impl Iterator<Item = &GraphDiff> {
        self.diffs.iter().map(AsRef::as_ref)
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    /// Replay all diffs in recording order.
    pub fn apply(&self, handler: &mut impl GraphChangeHandler) {
        for diff in &self.diffs {
            diff.apply(handler);
        }
    }

    /// Undo all diffs, newest first.
    pub fn undo(&self, handler: &mut impl GraphChangeHandler) {
        for diff in self.diffs.iter().rev() {
            diff.undo(handler);
        }
    }
}
