//! In-process cluster registry.
//!
//! `ClusterRegistry` is the in-memory stand-in for a discovery layer: it
//! tracks the node set, bumps the topology version on every membership
//! change, and broadcasts [`TopologyEvent`]s to subscribers. Tests and
//! embeddings drive it directly through `join` / `leave` / `fail`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;
use trellis_core::{NodeId, TopologyVersion};

use crate::discovery::{Discovery, NodeInfo, TopologyEvent, TopologyEventKind};

/// Capacity of the topology event channel. Subscribers that lag further
/// than this lose events, like any slow discovery listener would.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct RegistryState {
    nodes: HashMap<NodeId, NodeInfo>,
    /// Nodes temporarily failing active pings while still in the topology.
    unpingable: HashSet<NodeId>,
}

/// Shared in-memory cluster membership registry.
///
/// Clones share the same membership state and event stream.
#[derive(Clone)]
pub struct ClusterRegistry {
    local: NodeId,
    state: Arc<Mutex<RegistryState>>,
    version: Arc<AtomicU64>,
    events: broadcast::Sender<TopologyEvent>,
}

fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClusterRegistry {
    /// Creates a registry whose local node is `local`, with `local` already
    /// joined.
    #[must_use]
    pub fn new(local: NodeInfo) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let local_id = local.id;

        let mut nodes = HashMap::new();
        nodes.insert(local_id, local);

        Self {
            local: local_id,
            state: Arc::new(Mutex::new(RegistryState {
                nodes,
                unpingable: HashSet::new(),
            })),
            version: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    /// Returns a view of the same cluster as seen from `local`.
    ///
    /// The node must already be a member. Views share membership state and
    /// events; only the local identity differs.
    #[must_use]
    pub fn view_from(&self, local: NodeId) -> Self {
        Self {
            local,
            state: Arc::clone(&self.state),
            version: Arc::clone(&self.version),
            events: self.events.clone(),
        }
    }

    /// Adds a node to the topology and broadcasts `NodeJoined`.
    pub fn join(&self, info: NodeInfo) {
        let id = info.id;

        lock(&self.state).nodes.insert(id, info);

        self.fire(TopologyEventKind::NodeJoined, id);
    }

    /// Removes a node gracefully and broadcasts `NodeLeft`.
    pub fn leave(&self, id: NodeId) {
        self.remove(id, TopologyEventKind::NodeLeft);
    }

    /// Drops a failed node and broadcasts `NodeFailed`.
    pub fn fail(&self, id: NodeId) {
        self.remove(id, TopologyEventKind::NodeFailed);
    }

    /// Marks a member node as unreachable for active pings without removing
    /// it from the topology.
    pub fn set_pingable(&self, id: NodeId, pingable: bool) {
        let mut state = lock(&self.state);

        if pingable {
            state.unpingable.remove(&id);
        } else {
            state.unpingable.insert(id);
        }
    }

    fn remove(&self, id: NodeId, kind: TopologyEventKind) {
        let removed = lock(&self.state).nodes.remove(&id).is_some();

        if removed {
            self.fire(kind, id);
        }
    }

    fn fire(&self, kind: TopologyEventKind, node: NodeId) {
        let version = TopologyVersion::new(self.version.fetch_add(1, Ordering::AcqRel) + 1);

        debug!(?kind, %node, %version, "topology changed");

        // No subscribers is fine; send only fails when none are listening.
        let _ = self.events.send(TopologyEvent { kind, node, version });
    }
}

#[async_trait]
impl Discovery for ClusterRegistry {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn node(&self, id: NodeId) -> Option<NodeInfo> {
        lock(&self.state).nodes.get(&id).cloned()
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        let state = lock(&self.state);

        let mut nodes: Vec<_> = state.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    fn alive(&self, id: NodeId) -> bool {
        lock(&self.state).nodes.contains_key(&id)
    }

    async fn ping(&self, id: NodeId) -> bool {
        let state = lock(&self.state);

        state.nodes.contains_key(&id) && !state.unpingable.contains(&id)
    }

    fn topology_version(&self) -> TopologyVersion {
        TopologyVersion::new(self.version.load(Ordering::Acquire))
    }

    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::CacheName;

    use crate::discovery::CacheMode;

    fn node(id: u64) -> NodeInfo {
        NodeInfo::new(
            NodeId::new(id),
            vec![(CacheName::new("c"), CacheMode::Partitioned)],
        )
    }

    #[tokio::test]
    async fn test_join_and_leave_bump_version() {
        let registry = ClusterRegistry::new(node(1));
        let v0 = registry.topology_version();

        registry.join(node(2));
        assert!(registry.topology_version() > v0);
        assert!(registry.alive(NodeId::new(2)));

        registry.leave(NodeId::new(2));
        assert!(!registry.alive(NodeId::new(2)));
        assert_eq!(registry.topology_version().get(), v0.get() + 2);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let registry = ClusterRegistry::new(node(1));
        let mut events = registry.subscribe();

        registry.join(node(2));
        registry.fail(NodeId::new(2));

        let joined = events.recv().await.expect("join event");
        assert_eq!(joined.kind, TopologyEventKind::NodeJoined);
        assert_eq!(joined.node, NodeId::new(2));

        let failed = events.recv().await.expect("fail event");
        assert_eq!(failed.kind, TopologyEventKind::NodeFailed);
        assert!(failed.version > joined.version);
    }

    #[tokio::test]
    async fn test_removing_absent_node_fires_nothing() {
        let registry = ClusterRegistry::new(node(1));
        let mut events = registry.subscribe();

        registry.leave(NodeId::new(9));

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_honours_unpingable_mark() {
        let registry = ClusterRegistry::new(node(1));
        registry.join(node(2));

        assert!(registry.ping(NodeId::new(2)).await);

        registry.set_pingable(NodeId::new(2), false);
        assert!(!registry.ping(NodeId::new(2)).await);
        assert!(registry.alive(NodeId::new(2)));
    }

    #[tokio::test]
    async fn test_view_from_shares_membership() {
        let registry = ClusterRegistry::new(node(1));
        registry.join(node(2));

        let view = registry.view_from(NodeId::new(2));
        assert_eq!(view.local_node(), NodeId::new(2));
        assert!(view.alive(NodeId::new(1)));

        registry.join(node(3));
        assert!(view.alive(NodeId::new(3)));
    }
}
