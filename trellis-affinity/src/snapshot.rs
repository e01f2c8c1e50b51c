//! Per-cache affinity snapshot.
//!
//! An `AffinitySnapshot` binds a cache's affinity configuration to the
//! discovery view and memoizes partition → owner-list lookups per topology
//! version. `clean_up` drops memo entries for versions older than the
//! current one; the resolver calls it on every topology event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use trellis_core::{CacheName, NodeId, PartitionId, TopologyVersion};

use trellis_cluster::Discovery;

use crate::function::AffinityConfig;

/// Affinity view of one cache, valid across topology versions.
pub struct AffinitySnapshot {
    cache: CacheName,
    config: AffinityConfig,
    discovery: Arc<dyn Discovery>,
    /// Memoized owner lists keyed by (partition, version).
    owners: Mutex<HashMap<(PartitionId, TopologyVersion), Arc<Vec<NodeId>>>>,
}

fn lock<'a>(
    owners: &'a Mutex<HashMap<(PartitionId, TopologyVersion), Arc<Vec<NodeId>>>>,
) -> MutexGuard<'a, HashMap<(PartitionId, TopologyVersion), Arc<Vec<NodeId>>>> {
    owners.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AffinitySnapshot {
    /// Creates a snapshot for `cache` over the given discovery view.
    #[must_use]
    pub fn new(cache: CacheName, config: AffinityConfig, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            cache,
            config,
            discovery,
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cache this snapshot describes.
    #[must_use]
    pub fn cache(&self) -> &CacheName {
        &self.cache
    }

    /// Returns the affinity key for a cache key.
    #[must_use]
    pub fn affinity_key(&self, key: &Bytes) -> Bytes {
        self.config.mapper.affinity_key(key)
    }

    /// Returns the partition owning a cache key.
    #[must_use]
    pub fn partition(&self, key: &Bytes) -> PartitionId {
        let affinity_key = self.affinity_key(key);
        self.config.function.partition(&affinity_key)
    }

    /// Returns the ordered owner list for a partition at a topology
    /// version. Empty when no node currently hosts the cache.
    #[must_use]
    pub fn nodes(&self, partition: PartitionId, version: TopologyVersion) -> Arc<Vec<NodeId>> {
        if let Some(owners) = lock(&self.owners).get(&(partition, version)) {
            return Arc::clone(owners);
        }

        let mut candidates: Vec<NodeId> = self
            .discovery
            .nodes()
            .into_iter()
            .filter(|node| node.hosts_cache(&self.cache))
            .map(|node| node.id)
            .collect();
        candidates.sort_unstable();

        let owners = Arc::new(self.config.function.assign(partition, &candidates));

        lock(&self.owners)
            .entry((partition, version))
            .or_insert_with(|| Arc::clone(&owners));

        owners
    }

    /// Returns the primary owner for a cache key at a topology version.
    #[must_use]
    pub fn primary(&self, key: &Bytes, version: TopologyVersion) -> Option<NodeId> {
        let partition = self.partition(key);
        self.nodes(partition, version).first().copied()
    }

    /// Drops memoized owner lists for versions older than `current`.
    pub fn clean_up(&self, current: TopologyVersion) {
        lock(&self.owners).retain(|(_, version), _| *version >= current);
    }

    /// Number of memoized owner lists. Test hook.
    #[must_use]
    pub fn memo_len(&self) -> usize {
        lock(&self.owners).len()
    }
}

impl std::fmt::Debug for AffinitySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinitySnapshot")
            .field("cache", &self.cache)
            .field("memo_len", &self.memo_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_cluster::{CacheMode, ClusterRegistry, NodeInfo};

    fn cluster() -> (ClusterRegistry, CacheName) {
        let cache = CacheName::new("c");
        let registry = ClusterRegistry::new(NodeInfo::new(
            NodeId::new(1),
            vec![(cache.clone(), CacheMode::Partitioned)],
        ));
        registry.join(NodeInfo::new(
            NodeId::new(2),
            vec![(cache.clone(), CacheMode::Partitioned)],
        ));
        (registry, cache)
    }

    #[tokio::test]
    async fn test_primary_is_stable_within_version() {
        let (registry, cache) = cluster();
        let snapshot = AffinitySnapshot::new(
            cache,
            AffinityConfig::standard(),
            Arc::new(registry.clone()),
        );

        let key = Bytes::from_static(b"k1");
        let version = registry.topology_version();

        let first = snapshot.primary(&key, version);
        let second = snapshot.primary(&key, version);

        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_clean_up_drops_old_versions() {
        let (registry, cache) = cluster();
        let snapshot = AffinitySnapshot::new(
            cache.clone(),
            AffinityConfig::standard(),
            Arc::new(registry.clone()),
        );

        let v1 = registry.topology_version();
        let _ = snapshot.nodes(PartitionId::new(0), v1);
        let _ = snapshot.nodes(PartitionId::new(1), v1);
        assert_eq!(snapshot.memo_len(), 2);

        registry.join(NodeInfo::new(
            NodeId::new(3),
            vec![(cache, CacheMode::Partitioned)],
        ));
        let v2 = registry.topology_version();
        let _ = snapshot.nodes(PartitionId::new(0), v2);

        snapshot.clean_up(v2);
        assert_eq!(snapshot.memo_len(), 1);
    }

    #[tokio::test]
    async fn test_no_hosting_nodes_yields_empty_owner_list() {
        let registry = ClusterRegistry::new(NodeInfo::new(NodeId::new(1), Vec::new()));
        let snapshot = AffinitySnapshot::new(
            CacheName::new("absent"),
            AffinityConfig::standard(),
            Arc::new(registry.clone()),
        );

        let owners = snapshot.nodes(PartitionId::new(5), registry.topology_version());
        assert!(owners.is_empty());
    }
}
