//! Affinity resolver - lazily-resolved per-cache snapshots.
//!
//! The resolver keeps a concurrent map from cache name to a once-cell
//! holding the cache's [`AffinitySnapshot`]. The first caller for a cache
//! performs the resolution while later callers await the same cell, so all
//! of them share one snapshot instance. A failed resolution removes the
//! cell (compared by identity) so the next caller starts fresh.
//!
//! Topology departures schedule a delayed sweep that drops cells for caches
//! no longer hosted anywhere; the delay absorbs event bursts and nodes that
//! briefly disappear. Every event also prunes per-version memo tables on
//! the live snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use trellis_core::{CacheName, Entry, Limits, NodeId};

use trellis_cluster::{CacheMode, Discovery, TopologyEvent};

use crate::error::{ExchangeError, ResolveError, ResolveResult};
use crate::function::AffinityConfig;
use crate::snapshot::AffinitySnapshot;

type SnapshotCell = Arc<OnceCell<Arc<AffinitySnapshot>>>;

/// Source of affinity configurations.
///
/// `local_config` serves caches hosted by the local node; `fetch` asks a
/// remote hosting node for the cache's configuration.
#[async_trait]
pub trait AffinityExchange: Send + Sync + 'static {
    /// Returns the locally-known configuration for a cache, if any.
    fn local_config(&self, cache: &CacheName) -> Option<AffinityConfig>;

    /// Fetches the configuration for a cache from a remote hosting node.
    ///
    /// # Errors
    /// Returns an error when the remote node cannot supply the
    /// configuration; the resolver retries per its limits.
    async fn fetch(&self, cache: &CacheName, from: NodeId) -> Result<AffinityConfig, ExchangeError>;
}

/// Process-local affinity exchange backed by a shared configuration table.
///
/// Stands in for the remote affinity request of a real grid; tests can make
/// a bounded number of fetches fail to exercise the retry loop.
pub struct StaticAffinityExchange {
    configs: Mutex<HashMap<CacheName, AffinityConfig>>,
    fail_fetches: Mutex<u32>,
}

impl StaticAffinityExchange {
    /// Creates an empty exchange.
    #[must_use]
    pub fn new() -> Self {
        Self {
            configs: Mutex::new(HashMap::new()),
            fail_fetches: Mutex::new(0),
        }
    }

    /// Registers the configuration for a cache.
    pub fn register(&self, cache: CacheName, config: AffinityConfig) {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache, config);
    }

    /// Makes the next `count` fetches fail. Test hook.
    pub fn fail_next_fetches(&self, count: u32) {
        *self
            .fail_fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = count;
    }
}

impl Default for StaticAffinityExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AffinityExchange for StaticAffinityExchange {
    fn local_config(&self, cache: &CacheName) -> Option<AffinityConfig> {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cache)
            .cloned()
    }

    async fn fetch(&self, cache: &CacheName, from: NodeId) -> Result<AffinityConfig, ExchangeError> {
        {
            let mut failures = self
                .fail_fetches
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if *failures > 0 {
                *failures -= 1;
                return Err(ExchangeError::new(format!(
                    "injected fetch failure from {from}"
                )));
            }
        }

        self.local_config(cache)
            .ok_or_else(|| ExchangeError::new(format!("{from} has no configuration for {cache}")))
    }
}

/// Resolves cache keys to owning nodes.
pub struct AffinityResolver {
    discovery: Arc<dyn Discovery>,
    exchange: Arc<dyn AffinityExchange>,
    limits: Limits,
    cells: Mutex<HashMap<CacheName, SnapshotCell>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock_cells(
    cells: &Mutex<HashMap<CacheName, SnapshotCell>>,
) -> MutexGuard<'_, HashMap<CacheName, SnapshotCell>> {
    cells.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AffinityResolver {
    /// Creates a resolver and subscribes it to topology events.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        discovery: Arc<dyn Discovery>,
        exchange: Arc<dyn AffinityExchange>,
        limits: Limits,
    ) -> Arc<Self> {
        let resolver = Arc::new(Self {
            discovery,
            exchange,
            limits,
            cells: Mutex::new(HashMap::new()),
            event_task: Mutex::new(None),
        });

        let events = resolver.discovery.subscribe();
        let task = tokio::spawn(Self::event_loop(Arc::downgrade(&resolver), events));

        *resolver
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        resolver
    }

    /// Maps a single key to its owning node.
    ///
    /// # Errors
    /// Fails when no node hosts the cache or resolution fails.
    pub async fn map_key(&self, cache: &CacheName, key: &Bytes) -> ResolveResult<NodeId> {
        if let Some(local) = self.local_mode_owner(cache) {
            return Ok(local);
        }

        let snapshot = self.resolve(cache).await?;
        let version = self.discovery.topology_version();

        snapshot
            .primary(key, version)
            .ok_or_else(|| ResolveError::NoCacheNode {
                cache: cache.clone(),
            })
    }

    /// Groups entries by their owning node.
    ///
    /// Grouping preserves arrival order within each group but guarantees
    /// nothing across groups.
    ///
    /// # Errors
    /// Fails when no node hosts the cache or resolution fails.
    pub async fn map_keys(
        &self,
        cache: &CacheName,
        entries: Vec<Entry>,
    ) -> ResolveResult<HashMap<NodeId, Vec<Entry>>> {
        if entries.is_empty() {
            return Ok(HashMap::new());
        }

        if let Some(local) = self.local_mode_owner(cache) {
            return Ok(HashMap::from([(local, entries)]));
        }

        let snapshot = self.resolve(cache).await?;
        let version = self.discovery.topology_version();

        let mut groups: HashMap<NodeId, Vec<Entry>> = HashMap::new();

        for entry in entries {
            let owner =
                snapshot
                    .primary(&entry.key, version)
                    .ok_or_else(|| ResolveError::NoCacheNode {
                        cache: cache.clone(),
                    })?;

            groups.entry(owner).or_default().push(entry);
        }

        Ok(groups)
    }

    /// Returns the affinity key a cache key co-locates under.
    ///
    /// # Errors
    /// Fails when the cache cannot be resolved.
    pub async fn affinity_key(&self, cache: &CacheName, key: &Bytes) -> ResolveResult<Bytes> {
        let snapshot = self.resolve(cache).await?;
        Ok(snapshot.affinity_key(key))
    }

    /// Resolves the affinity snapshot for a cache.
    ///
    /// Concurrent callers for the same cache receive the same snapshot
    /// instance.
    ///
    /// # Errors
    /// Fails when no node hosts the cache, the cache is in local mode on a
    /// remote node, or the configuration exchange exhausts its retries.
    pub async fn resolve(&self, cache: &CacheName) -> ResolveResult<Arc<AffinitySnapshot>> {
        let cell = Arc::clone(
            lock_cells(&self.cells)
                .entry(cache.clone())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        );

        let result = cell
            .get_or_try_init(|| self.resolve_slow(cache))
            .await
            .map(Arc::clone);

        if result.is_err() {
            // Compare-and-remove: only evict the cell this attempt used, a
            // concurrent re-resolution may have installed a fresh one.
            let mut cells = lock_cells(&self.cells);

            if let Some(current) = cells.get(cache) {
                if Arc::ptr_eq(current, &cell) {
                    cells.remove(cache);
                }
            }
        }

        result
    }

    /// Number of cached cache-name entries. Test hook.
    #[must_use]
    pub fn cached_caches(&self) -> usize {
        lock_cells(&self.cells).len()
    }

    fn local_mode_owner(&self, cache: &CacheName) -> Option<NodeId> {
        let local = self.discovery.local_node();
        let info = self.discovery.node(local)?;

        (info.cache_mode(cache) == Some(CacheMode::Local)).then_some(local)
    }

    async fn resolve_slow(&self, cache: &CacheName) -> ResolveResult<Arc<AffinitySnapshot>> {
        let local = self.discovery.local_node();

        if let Some(info) = self.discovery.node(local) {
            if info.hosts_cache(cache) {
                let config =
                    self.exchange
                        .local_config(cache)
                        .ok_or_else(|| ResolveError::NoCacheNode {
                            cache: cache.clone(),
                        })?;

                return Ok(Arc::new(AffinitySnapshot::new(
                    cache.clone(),
                    config,
                    Arc::clone(&self.discovery),
                )));
            }
        }

        let candidates: Vec<_> = self
            .discovery
            .nodes()
            .into_iter()
            .filter(|node| node.id != local && node.hosts_cache(cache))
            .collect();

        if candidates.is_empty() {
            return Err(ResolveError::NoCacheNode {
                cache: cache.clone(),
            });
        }

        let mut attempts: u32 = 0;
        let mut last_reason = String::new();

        loop {
            let node = &candidates[attempts as usize % candidates.len()];
            attempts += 1;

            if node.cache_mode(cache) == Some(CacheMode::Local) {
                return Err(ResolveError::LocalModeMismatch {
                    cache: cache.clone(),
                    node: node.id,
                });
            }

            match self.exchange.fetch(cache, node.id).await {
                Ok(config) => {
                    return Ok(Arc::new(AffinitySnapshot::new(
                        cache.clone(),
                        config,
                        Arc::clone(&self.discovery),
                    )));
                }
                Err(err) => {
                    debug!(%cache, node = %node.id, %err, "affinity fetch failed, will retry");
                    last_reason = err.reason;
                }
            }

            if attempts >= self.limits.resolve_retries {
                return Err(ResolveError::ExchangeFailed {
                    cache: cache.clone(),
                    attempts,
                    reason: last_reason,
                });
            }

            tokio::time::sleep(Duration::from_millis(self.limits.resolve_retry_wait_ms)).await;
        }
    }

    async fn event_loop(resolver: Weak<Self>, mut events: broadcast::Receiver<TopologyEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(resolver) = resolver.upgrade() else {
                        return;
                    };

                    resolver.on_topology_event(&event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "affinity resolver lagged behind topology events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn on_topology_event(self: &Arc<Self>, event: &TopologyEvent) {
        let snapshots: Vec<Arc<AffinitySnapshot>> = {
            let cells = lock_cells(&self.cells);

            if cells.is_empty() {
                return;
            }

            cells
                .values()
                .filter_map(|cell| cell.get().map(Arc::clone))
                .collect()
        };

        if event.kind.is_departure() {
            self.schedule_orphan_sweep();
        }

        // Obsolete per-version owner tables go on every membership change.
        for snapshot in snapshots {
            snapshot.clean_up(event.version);
        }
    }

    /// Schedules removal of cells whose caches are no longer hosted by any
    /// present node. Delayed so an event burst or a briefly-absent node
    /// does not thrash the cache.
    fn schedule_orphan_sweep(self: &Arc<Self>) {
        let hosted: HashSet<CacheName> = self
            .discovery
            .nodes()
            .into_iter()
            .flat_map(|node| node.caches.into_iter().map(|(name, _)| name))
            .collect();

        let orphans: Vec<(CacheName, SnapshotCell)> = lock_cells(&self.cells)
            .iter()
            .filter(|(name, _)| !hosted.contains(*name))
            .map(|(name, cell)| (name.clone(), Arc::clone(cell)))
            .collect();

        if orphans.is_empty() {
            return;
        }

        let delay = Duration::from_millis(self.limits.affinity_cleanup_delay_ms);
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(resolver) = weak.upgrade() else {
                return;
            };

            let mut cells = lock_cells(&resolver.cells);

            for (name, cell) in orphans {
                if let Some(current) = cells.get(&name) {
                    if Arc::ptr_eq(current, &cell) {
                        debug!(cache = %name, "dropping affinity for departed cache");
                        cells.remove(&name);
                    }
                }
            }
        });
    }
}

impl Drop for AffinityResolver {
    fn drop(&mut self) {
        if let Some(task) = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for AffinityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityResolver")
            .field("cached_caches", &self.cached_caches())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_cluster::{ClusterRegistry, NodeInfo};

    fn partitioned(cache: &CacheName) -> Vec<(CacheName, CacheMode)> {
        vec![(cache.clone(), CacheMode::Partitioned)]
    }

    /// Local node 1 hosts nothing; nodes 2 and 3 host the cache.
    fn remote_cluster(cache: &CacheName) -> ClusterRegistry {
        let registry = ClusterRegistry::new(NodeInfo::new(NodeId::new(1), Vec::new()));
        registry.join(NodeInfo::new(NodeId::new(2), partitioned(cache)));
        registry.join(NodeInfo::new(NodeId::new(3), partitioned(cache)));
        registry
    }

    fn exchange_with(cache: &CacheName) -> Arc<StaticAffinityExchange> {
        let exchange = Arc::new(StaticAffinityExchange::new());
        exchange.register(cache.clone(), AffinityConfig::standard());
        exchange
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_snapshot() {
        let cache = CacheName::new("c");
        let registry = remote_cluster(&cache);
        let resolver = AffinityResolver::new(
            Arc::new(registry),
            exchange_with(&cache),
            Limits::default(),
        );

        let (a, b) = tokio::join!(resolver.resolve(&cache), resolver.resolve(&cache));

        let a = a.expect("resolve a");
        let b = b.expect("resolve b");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(resolver.cached_caches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failures_are_retried() {
        let cache = CacheName::new("c");
        let registry = remote_cluster(&cache);
        let exchange = exchange_with(&cache);
        exchange.fail_next_fetches(2);

        let resolver =
            AffinityResolver::new(Arc::new(registry), exchange, Limits::default());

        resolver.resolve(&cache).await.expect("third attempt wins");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_fails_and_clears_cell() {
        let cache = CacheName::new("c");
        let registry = remote_cluster(&cache);
        let exchange = exchange_with(&cache);
        exchange.fail_next_fetches(Limits::default().resolve_retries);

        let resolver =
            AffinityResolver::new(Arc::new(registry), Arc::clone(&exchange) as _, Limits::default());

        let err = resolver.resolve(&cache).await.expect_err("budget spent");
        assert!(matches!(err, ResolveError::ExchangeFailed { attempts, .. }
            if attempts == Limits::default().resolve_retries));
        assert_eq!(resolver.cached_caches(), 0);

        // A later call starts fresh and succeeds.
        resolver.resolve(&cache).await.expect("fresh cell");
    }

    #[tokio::test]
    async fn test_unhosted_cache_fails_with_no_cache_node() {
        let registry = ClusterRegistry::new(NodeInfo::new(NodeId::new(1), Vec::new()));
        let resolver = AffinityResolver::new(
            Arc::new(registry),
            Arc::new(StaticAffinityExchange::new()),
            Limits::default(),
        );

        let err = resolver
            .resolve(&CacheName::new("ghost"))
            .await
            .expect_err("nobody hosts it");
        assert!(matches!(err, ResolveError::NoCacheNode { .. }));
    }

    #[tokio::test]
    async fn test_remote_local_mode_is_rejected() {
        let cache = CacheName::new("c");
        let registry = ClusterRegistry::new(NodeInfo::new(NodeId::new(1), Vec::new()));
        registry.join(NodeInfo::new(
            NodeId::new(2),
            vec![(cache.clone(), CacheMode::Local)],
        ));

        let resolver = AffinityResolver::new(
            Arc::new(registry),
            exchange_with(&cache),
            Limits::default(),
        );

        let err = resolver.resolve(&cache).await.expect_err("local mode");
        assert!(matches!(err, ResolveError::LocalModeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_local_mode_on_local_node_maps_everything_locally() {
        let cache = CacheName::new("c");
        let registry = ClusterRegistry::new(NodeInfo::new(
            NodeId::new(1),
            vec![(cache.clone(), CacheMode::Local)],
        ));

        let resolver = AffinityResolver::new(
            Arc::new(registry),
            exchange_with(&cache),
            Limits::default(),
        );

        let groups = resolver
            .map_keys(&cache, vec![Entry::put("a", "1"), Entry::put("b", "2")])
            .await
            .expect("map");

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&NodeId::new(1)].len(), 2);
    }

    #[tokio::test]
    async fn test_map_keys_groups_by_owner() {
        let cache = CacheName::new("c");
        let registry = remote_cluster(&cache);
        let resolver = AffinityResolver::new(
            Arc::new(registry),
            exchange_with(&cache),
            Limits::default(),
        );

        let entries: Vec<Entry> = (0..64)
            .map(|i| Entry::put(format!("key-{i}"), format!("v{i}")))
            .collect();

        let groups = resolver.map_keys(&cache, entries).await.expect("map");

        let total: usize = groups.values().map(Vec::len).sum();
        assert_eq!(total, 64);
        for owner in groups.keys() {
            assert!(*owner == NodeId::new(2) || *owner == NodeId::new(3));
        }

        // Single-key mapping agrees with the grouped mapping.
        let key = Bytes::from_static(b"key-0");
        let owner = resolver.map_key(&cache, &key).await.expect("map_key");
        assert!(groups[&owner].iter().any(|e| e.key == key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_cache_is_swept_after_delay() {
        let cache = CacheName::new("c");
        let registry = ClusterRegistry::new(NodeInfo::new(NodeId::new(1), Vec::new()));
        registry.join(NodeInfo::new(NodeId::new(2), partitioned(&cache)));

        let resolver = AffinityResolver::new(
            Arc::new(registry.clone()),
            exchange_with(&cache),
            Limits::default(),
        );

        resolver.resolve(&cache).await.expect("resolve");
        assert_eq!(resolver.cached_caches(), 1);

        registry.leave(NodeId::new(2));

        // Let the event task observe the departure and schedule the sweep.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(
            Limits::default().affinity_cleanup_delay_ms + 100,
        ))
        .await;
        tokio::task::yield_now().await;

        assert_eq!(resolver.cached_caches(), 0);
    }
}
