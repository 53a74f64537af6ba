//! Snapshot cache for the Cayenne object graph engine.
//!
//! `cayenne-cache` holds the last-known committed row of recently used
//! objects. One [`DataRowStore`] is shared by every context of a runtime:
//!
//! - **Bounded**: strict LRU over reads and writes.
//! - **Atomic batches**: commits apply their row changes under one lock.
//! - **Events**: every applied batch is published to the other contexts,
//!   which use it to refresh or invalidate their objects.

pub mod data_row_store;
pub mod event;

pub use data_row_store::{DEFAULT_SNAPSHOT_CACHE_SIZE, DataRowStore, StoreConfig, StoreStats};
pub use event::{SnapshotChanges, SnapshotEvent, Subscription};
