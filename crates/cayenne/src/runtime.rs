//! The runtime: shared mapping, data node and snapshot cache from which
//! object contexts are created.

use crate::config::RuntimeConfig;
use cayenne_cache::DataRowStore;
use cayenne_context::{ObjectContext, SharedContext};
use cayenne_core::{DataNode, EntityResolver};
use std::sync::Arc;

/// Owner of everything contexts share.
///
/// Contexts created by one runtime see each other's commits through the
/// common snapshot cache.
pub struct CayenneRuntime<N: DataNode> {
    config: RuntimeConfig,
    node: Arc<N>,
    resolver: Arc<EntityResolver>,
    cache: Arc<DataRowStore>,
}

impl<N: DataNode> std::fmt::Debug for CayenneRuntime<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CayenneRuntime")
            .field("name", &self.config.name)
            .field("node", &self.node.name())
            .field("entities", &self.resolver.entities().count())
            .field("cache", &self.cache.stats())
            .finish()
    }
}

impl<N: DataNode> CayenneRuntime<N> {
    pub fn new(node: N, resolver: EntityResolver, config: RuntimeConfig) -> Self {
        let cache = Arc::new(DataRowStore::new(config.store_config()));
        tracing::info!(
            runtime = %config.name,
            node = node.name(),
            snapshot_cache_size = config.snapshot_cache_size,
            sorter = %config.sorter,
            "Cayenne runtime started"
        );
        Self {
            config,
            node: Arc::new(node),
            resolver: Arc::new(resolver),
            cache,
        }
    }

    /// A fresh context subscribed to this runtime's snapshot cache.
    pub fn new_context(&self) -> ObjectContext<N> {
        ObjectContext::new(
            Arc::clone(&self.node),
            Arc::clone(&self.resolver),
            Arc::clone(&self.cache),
            self.config.context_config(),
        )
    }

    /// A fresh context behind a mutex.
    pub fn shared_context(&self) -> SharedContext<N> {
        SharedContext::new(self.new_context())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn data_node(&self) -> &Arc<N> {
        &self.node
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    pub fn snapshot_cache(&self) -> &Arc<DataRowStore> {
        &self.cache
    }

    /// Stop event delivery and drop cached snapshots. Contexts keep working
    /// but no longer see each other's commits.
    pub fn shutdown(&self) {
        self.cache.shutdown();
        tracing::info!(runtime = %self.config.name, "Cayenne runtime shut down");
    }
}
