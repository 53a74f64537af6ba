//! Bounded LRU store of committed row snapshots.

use crate::event::{SnapshotChanges, SnapshotEvent, Subscription};
use cayenne_core::{ContextId, DataRow, NO_VERSION, ObjectId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default number of snapshots kept by a store.
pub const DEFAULT_SNAPSHOT_CACHE_SIZE: usize = 10_000;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store name used in logs
    pub name: String,
    /// Maximum number of cached snapshots
    pub capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            capacity: DEFAULT_SNAPSHOT_CACHE_SIZE,
        }
    }
}

impl StoreConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the capacity. Zero is treated as one.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

/// Store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Snapshots currently cached
    pub entries: usize,
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries dropped to stay within capacity
    pub evictions: u64,
    /// Change batches applied
    pub batches: u64,
}

#[derive(Debug)]
struct CacheEntry {
    row: DataRow,
    tick: u64,
}

/// Entries plus their recency order. `order` maps the last touch tick of
/// every entry back to its id, so the first key is always the LRU entry.
#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<ObjectId, CacheEntry>,
    order: BTreeMap<u64, ObjectId>,
    tick: u64,
    stats: StoreStats,
}

impl StoreState {
    fn touch(&mut self, id: &ObjectId) -> Option<&DataRow> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(id)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, id.clone());
        Some(&entry.row)
    }

    fn put(&mut self, id: ObjectId, row: DataRow) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(previous) = self.entries.insert(id.clone(), CacheEntry { row, tick }) {
            self.order.remove(&previous.tick);
        }
        self.order.insert(tick, id);
    }

    fn purge(&mut self, id: &ObjectId) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                true
            }
            None => false,
        }
    }

    fn evict_overflow(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > capacity {
            let Some((_, id)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&id);
            evicted += 1;
        }
        self.stats.evictions += evicted as u64;
        evicted
    }

    fn cached_version(&self, id: &ObjectId) -> u64 {
        self.entries.get(id).map_or(NO_VERSION, |e| e.row.version())
    }
}

/// Process-wide snapshot cache shared by every context of a runtime.
///
/// A batch of changes is applied under one lock and published to the
/// subscribed contexts before the lock is released, so no reader observes a
/// half-applied batch and events arrive in batch order.
#[derive(Debug)]
pub struct DataRowStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    subscribers: Mutex<Vec<(ContextId, Sender<Arc<SnapshotEvent>>)>>,
    next_version: AtomicU64,
    running: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DataRowStore {
    pub fn new(config: StoreConfig) -> Self {
        let config = StoreConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        tracing::debug!(store = %config.name, capacity = config.capacity, "Snapshot cache created");
        Self {
            config,
            state: Mutex::new(StoreState::default()),
            subscribers: Mutex::new(Vec::new()),
            next_version: AtomicU64::new(NO_VERSION + 1),
            running: AtomicBool::new(true),
        }
    }

    /// Store with the given capacity and a default name.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(StoreConfig::default().capacity(capacity))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let state = lock(&self.state);
        StoreStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cached snapshot for an id. Counts as a use for LRU purposes.
    pub fn cached_snapshot(&self, id: &ObjectId) -> Option<DataRow> {
        let mut state = lock(&self.state);
        let row = state.touch(id).cloned();
        if row.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        tracing::trace!(id = %id, hit = row.is_some(), "Snapshot lookup");
        row
    }

    /// Cached snapshot without updating recency.
    pub fn peek(&self, id: &ObjectId) -> Option<DataRow> {
        lock(&self.state).entries.get(id).map(|e| e.row.clone())
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        lock(&self.state).entries.contains_key(id)
    }

    /// Version of the cached snapshot, or [`NO_VERSION`] when not cached.
    pub fn cached_version(&self, id: &ObjectId) -> u64 {
        lock(&self.state).cached_version(id)
    }

    fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    /// Apply a batch of changes and notify every subscriber except `source`.
    ///
    /// Updated rows are stamped with fresh versions, each replacing the
    /// version that was cached for its id. Deleted and invalidated ids are
    /// purged. Returns the published event.
    #[tracing::instrument(level = "debug", skip(self, changes), fields(store = %self.config.name))]
    pub fn process_snapshot_changes(
        &self,
        source: Option<ContextId>,
        changes: SnapshotChanges,
    ) -> Arc<SnapshotEvent> {
        let SnapshotChanges {
            updated,
            deleted,
            invalidated,
            indirectly_modified,
        } = changes;

        let mut state = lock(&self.state);
        let mut stamped = Vec::with_capacity(updated.len());
        if self.is_running() {
            for (id, mut row) in updated {
                let replaces = state.cached_version(&id);
                row.stamp(self.next_version(), replaces);
                state.put(id.clone(), row.clone());
                stamped.push((id, row));
            }
            for id in deleted.iter().chain(&invalidated) {
                state.purge(id);
            }
            let evicted = state.evict_overflow(self.config.capacity);
            state.stats.batches += 1;
            tracing::debug!(
                updated = stamped.len(),
                deleted = deleted.len(),
                invalidated = invalidated.len(),
                evicted,
                entries = state.entries.len(),
                "Snapshot batch applied"
            );
        } else {
            tracing::warn!("Snapshot batch ignored by a stopped store");
        }

        let event = Arc::new(SnapshotEvent {
            source,
            updated: stamped,
            deleted,
            invalidated,
            indirectly_modified,
        });
        if !event.is_empty() {
            self.publish(&event);
        }
        drop(state);
        event
    }

    /// Store freshly fetched rows.
    ///
    /// A row equal to the cached one keeps the cached version; a new or
    /// changed row gets a fresh version. Changed rows are published to the
    /// other subscribers as updates. Returns the stored rows in input order.
    #[tracing::instrument(level = "trace", skip(self, rows), fields(store = %self.config.name))]
    pub fn remember_fetched(
        &self,
        source: Option<ContextId>,
        rows: Vec<(ObjectId, DataRow)>,
    ) -> Vec<DataRow> {
        if !self.is_running() {
            return rows.into_iter().map(|(_, row)| row).collect();
        }
        let mut state = lock(&self.state);
        let mut stored = Vec::with_capacity(rows.len());
        let mut changed = Vec::new();
        for (id, mut row) in rows {
            if let Some(cached) = state.touch(&id) {
                if cached.same_values(&row) {
                    stored.push(cached.clone());
                    continue;
                }
                let replaces = cached.version();
                row.stamp(self.next_version(), replaces);
                changed.push((id.clone(), row.clone()));
            } else {
                row.stamp(self.next_version(), NO_VERSION);
            }
            state.put(id, row.clone());
            stored.push(row);
        }
        state.evict_overflow(self.config.capacity);
        if !changed.is_empty() {
            tracing::debug!(changed = changed.len(), "Fetched rows replaced cached snapshots");
            self.publish(&Arc::new(SnapshotEvent {
                source,
                updated: changed,
                deleted: Vec::new(),
                invalidated: Vec::new(),
                indirectly_modified: Vec::new(),
            }));
        }
        stored
    }

    fn publish(&self, event: &Arc<SnapshotEvent>) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|(subscriber, sender)| {
            if Some(*subscriber) == event.source {
                return true;
            }
            sender.send(Arc::clone(event)).is_ok()
        });
    }

    /// Subscribe a context to snapshot events.
    pub fn subscribe(&self, subscriber: ContextId) -> Subscription {
        let (sender, receiver) = mpsc::channel();
        if self.is_running() {
            let mut subscribers = lock(&self.subscribers);
            subscribers.retain(|(s, _)| *s != subscriber);
            subscribers.push((subscriber, sender));
            tracing::debug!(store = %self.config.name, %subscriber, "Context subscribed");
        }
        Subscription::new(subscriber, receiver)
    }

    pub fn unsubscribe(&self, subscriber: ContextId) {
        lock(&self.subscribers).retain(|(s, _)| *s != subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Drop every cached snapshot. Subscribers are kept.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.order.clear();
    }

    /// Stop the store: clear snapshots and detach every subscriber.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.clear();
            lock(&self.subscribers).clear();
            tracing::info!(store = %self.config.name, "Snapshot cache shut down");
        }
    }
}

impl Default for DataRowStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cayenne_core::Value;

    fn id(n: i64) -> ObjectId {
        ObjectId::single("Artist", "id", n)
    }

    fn row(n: i64, name: &str) -> DataRow {
        DataRow::from_pairs([("id", Value::BigInt(n)), ("name", Value::from(name))])
    }

    fn write(store: &DataRowStore, n: i64) {
        store.process_snapshot_changes(None, SnapshotChanges::new().updated(id(n), row(n, "x")));
    }

    #[test]
    fn capacity_two_keeps_latest_writes() {
        let store = DataRowStore::with_capacity(2);
        write(&store, 1);
        write(&store, 2);
        write(&store, 3);
        assert!(!store.contains(&id(1)));
        assert!(store.contains(&id(2)));
        assert!(store.contains(&id(3)));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn reads_refresh_recency() {
        let store = DataRowStore::with_capacity(2);
        write(&store, 1);
        write(&store, 2);
        assert!(store.cached_snapshot(&id(1)).is_some());
        write(&store, 3);
        assert!(store.contains(&id(1)));
        assert!(!store.contains(&id(2)));
    }

    #[test]
    fn peek_does_not_refresh_recency() {
        let store = DataRowStore::with_capacity(2);
        write(&store, 1);
        write(&store, 2);
        assert!(store.peek(&id(1)).is_some());
        write(&store, 3);
        assert!(!store.contains(&id(1)));
    }

    #[test]
    fn versions_chain_across_updates() {
        let store = DataRowStore::default();
        let first = store.process_snapshot_changes(None, SnapshotChanges::new().updated(id(1), row(1, "a")));
        let v1 = first.updated[0].1.version();
        assert_ne!(v1, NO_VERSION);
        assert_eq!(first.updated[0].1.replaces_version(), NO_VERSION);

        let second = store.process_snapshot_changes(None, SnapshotChanges::new().updated(id(1), row(1, "b")));
        assert!(second.updated[0].1.version() > v1);
        assert_eq!(second.updated[0].1.replaces_version(), v1);
        assert_eq!(store.cached_version(&id(1)), second.updated[0].1.version());
    }

    #[test]
    fn deleted_and_invalidated_ids_are_purged() {
        let store = DataRowStore::default();
        write(&store, 1);
        write(&store, 2);
        store.process_snapshot_changes(
            None,
            SnapshotChanges::new().deleted(id(1)).invalidated(id(2)),
        );
        assert!(store.is_empty());
    }

    #[test]
    fn events_skip_the_source_context() {
        let store = DataRowStore::default();
        let a = ContextId::next();
        let b = ContextId::next();
        let sub_a = store.subscribe(a);
        let sub_b = store.subscribe(b);

        store.process_snapshot_changes(Some(a), SnapshotChanges::new().updated(id(1), row(1, "a")));
        assert!(sub_a.try_drain().is_empty());
        let events = sub_b.try_drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, Some(a));
        assert_eq!(events[0].updated[0].0, id(1));
    }

    #[test]
    fn dropped_subscriptions_are_detached() {
        let store = DataRowStore::default();
        let sub = store.subscribe(ContextId::next());
        assert_eq!(store.subscriber_count(), 1);
        drop(sub);
        write(&store, 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn remembered_rows_keep_version_until_changed() {
        let store = DataRowStore::default();
        let watcher = store.subscribe(ContextId::next());
        let first = store.remember_fetched(None, vec![(id(1), row(1, "a"))]);
        let again = store.remember_fetched(None, vec![(id(1), row(1, "a"))]);
        assert_eq!(first[0].version(), again[0].version());
        assert!(watcher.try_drain().is_empty());

        let changed = store.remember_fetched(None, vec![(id(1), row(1, "b"))]);
        assert_eq!(changed[0].replaces_version(), first[0].version());
        assert_eq!(watcher.try_drain().len(), 1);
    }

    #[test]
    fn lookups_are_counted() {
        let store = DataRowStore::default();
        write(&store, 1);
        store.cached_snapshot(&id(1));
        store.cached_snapshot(&id(2));
        let stats = store.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries, stats.batches), (1, 1, 1, 1));
    }

    #[test]
    fn shutdown_clears_and_detaches() {
        let store = DataRowStore::default();
        let _sub = store.subscribe(ContextId::next());
        write(&store, 1);
        store.shutdown();
        assert!(!store.is_running());
        assert!(store.is_empty());
        assert_eq!(store.subscriber_count(), 0);
        write(&store, 2);
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_batches_apply_atomically() {
        let store = Arc::new(DataRowStore::with_capacity(1_000));
        std::thread::scope(|scope| {
            for t in 0..4_i64 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for n in 0..50 {
                        let key = t * 100 + n;
                        let changes = SnapshotChanges::new()
                            .updated(id(key), row(key, "a"))
                            .updated(id(key + 50), row(key + 50, "b"));
                        store.process_snapshot_changes(None, changes);
                    }
                });
            }
        });
        assert_eq!(store.len(), 400);
        assert_eq!(store.stats().batches, 200);
    }

    #[test]
    fn events_serialize() {
        let store = DataRowStore::default();
        let event = store.process_snapshot_changes(
            Some(ContextId::next()),
            SnapshotChanges::new().updated(id(1), row(1, "a")).deleted(id(2)),
        );
        let json = serde_json::to_string(event.as_ref()).unwrap();
        let back: SnapshotEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, event.as_ref());
    }
}
