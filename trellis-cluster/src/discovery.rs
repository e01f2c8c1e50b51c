//! Discovery contract - node identity, enumeration, and topology events.
//!
//! The loader never talks to a discovery protocol directly; it consumes this
//! trait. Events are delivered over a `broadcast` channel so any number of
//! components (loaders, the affinity resolver) can subscribe independently.

use async_trait::async_trait;
use tokio::sync::broadcast;
use trellis_core::{CacheName, NodeId, TopologyVersion};

/// Kind of a node membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEventKind {
    /// A node joined the cluster.
    NodeJoined,
    /// A node left the cluster gracefully.
    NodeLeft,
    /// A node was dropped after failing liveness checks.
    NodeFailed,
}

impl TopologyEventKind {
    /// Returns true for events that remove a node from the topology.
    #[must_use]
    pub const fn is_departure(self) -> bool {
        matches!(self, Self::NodeLeft | Self::NodeFailed)
    }
}

/// A node membership change observed by the discovery layer.
#[derive(Debug, Clone)]
pub struct TopologyEvent {
    /// What happened.
    pub kind: TopologyEventKind,
    /// The node the event is about.
    pub node: NodeId,
    /// Topology version after the change.
    pub version: TopologyVersion,
}

/// Deployment mode of a cache on a hosting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Data is split into partitions spread across hosting nodes.
    Partitioned,
    /// Every hosting node holds a full copy.
    Replicated,
    /// Single-owner cache visible only to its hosting node.
    Local,
}

/// Static description of a cluster node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// The node's identifier.
    pub id: NodeId,
    /// Caches hosted by this node, with their modes.
    pub caches: Vec<(CacheName, CacheMode)>,
}

impl NodeInfo {
    /// Creates a node description.
    #[must_use]
    pub fn new(id: NodeId, caches: Vec<(CacheName, CacheMode)>) -> Self {
        Self { id, caches }
    }

    /// Returns true if this node hosts the named cache.
    #[must_use]
    pub fn hosts_cache(&self, cache: &CacheName) -> bool {
        self.caches.iter().any(|(name, _)| name == cache)
    }

    /// Returns the mode of the named cache on this node, if hosted.
    #[must_use]
    pub fn cache_mode(&self, cache: &CacheName) -> Option<CacheMode> {
        self.caches
            .iter()
            .find(|(name, _)| name == cache)
            .map(|(_, mode)| *mode)
    }
}

/// Discovery service contract.
///
/// Lookup methods reflect the current topology snapshot; `ping` may perform
/// I/O and is therefore async.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Returns the local node's identifier.
    fn local_node(&self) -> NodeId;

    /// Returns the node's description, or `None` if it is not in the
    /// current topology.
    fn node(&self, id: NodeId) -> Option<NodeInfo>;

    /// Returns all nodes in the current topology.
    fn nodes(&self) -> Vec<NodeInfo>;

    /// Returns true if the node is present and considered alive.
    fn alive(&self, id: NodeId) -> bool;

    /// Actively checks reachability of the node.
    async fn ping(&self, id: NodeId) -> bool;

    /// Returns the current topology version.
    fn topology_version(&self) -> TopologyVersion;

    /// Subscribes to membership changes.
    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_departure_kinds() {
        assert!(TopologyEventKind::NodeLeft.is_departure());
        assert!(TopologyEventKind::NodeFailed.is_departure());
        assert!(!TopologyEventKind::NodeJoined.is_departure());
    }

    #[test]
    fn test_node_info_cache_lookup() {
        let info = NodeInfo::new(
            NodeId::new(1),
            vec![
                (CacheName::new("orders"), CacheMode::Partitioned),
                (CacheName::new("local-only"), CacheMode::Local),
            ],
        );

        assert!(info.hosts_cache(&CacheName::new("orders")));
        assert!(!info.hosts_cache(&CacheName::new("missing")));
        assert_eq!(
            info.cache_mode(&CacheName::new("local-only")),
            Some(CacheMode::Local)
        );
        assert_eq!(info.cache_mode(&CacheName::new("missing")), None);
    }
}
