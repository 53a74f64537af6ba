//! Snapshot change batches and the events published for them.

use cayenne_core::{ContextId, DataRow, ObjectId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};

/// One batch of snapshot changes produced by a commit or a refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotChanges {
    /// Inserted or updated rows, keyed by the permanent id of their object.
    pub updated: Vec<(ObjectId, DataRow)>,
    /// Ids whose rows were deleted.
    pub deleted: Vec<ObjectId>,
    /// Ids whose snapshots must be dropped without being deleted.
    pub invalidated: Vec<ObjectId>,
    /// Ids whose to-many relationships changed without a row change
    /// (flattened join rows, or the FK side of a reverse relationship).
    pub indirectly_modified: Vec<ObjectId>,
}

impl SnapshotChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updated(mut self, id: ObjectId, row: DataRow) -> Self {
        self.updated.push((id, row));
        self
    }

    pub fn deleted(mut self, id: ObjectId) -> Self {
        self.deleted.push(id);
        self
    }

    pub fn invalidated(mut self, id: ObjectId) -> Self {
        self.invalidated.push(id);
        self
    }

    pub fn indirectly_modified(mut self, id: ObjectId) -> Self {
        self.indirectly_modified.push(id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.indirectly_modified.is_empty()
    }
}

/// Notification of an applied [`SnapshotChanges`] batch.
///
/// Rows in `updated` carry the versions stamped by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEvent {
    /// Context whose commit produced the batch, if any.
    pub source: Option<ContextId>,
    pub updated: Vec<(ObjectId, DataRow)>,
    pub deleted: Vec<ObjectId>,
    pub invalidated: Vec<ObjectId>,
    pub indirectly_modified: Vec<ObjectId>,
}

impl SnapshotEvent {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.indirectly_modified.is_empty()
    }
}

/// Receiving end of a store subscription.
///
/// Events are queued until drained; dropping the subscription detaches it
/// from the store on the next publish.
#[derive(Debug)]
pub struct Subscription {
    subscriber: ContextId,
    receiver: Receiver<Arc<SnapshotEvent>>,
}

impl Subscription {
    pub(crate) fn new(subscriber: ContextId, receiver: Receiver<Arc<SnapshotEvent>>) -> Self {
        Self {
            subscriber,
            receiver,
        }
    }

    pub fn subscriber(&self) -> ContextId {
        self.subscriber
    }

    /// All events published since the last drain, oldest first.
    pub fn try_drain(&self) -> Vec<Arc<SnapshotEvent>> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        events
    }
}
