//! In-process transport connecting nodes within one process.
//!
//! `MemoryNetwork` is the hub: it owns the topic → listener table for every
//! node and hands out per-node [`MemoryTransport`] endpoints. Every send is
//! pushed through the binary codec so tests exercise the same encode/decode
//! path a TCP transport would.
//!
//! Fault hooks let tests sever routes without touching topology state,
//! which is how "destination alive but unreachable" scenarios are built.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use trellis_core::NodeId;

use crate::codec::{decode_message, encode_message};
use crate::message::{Message, Topic};
use crate::transport::{MessageListener, Transport, TransportError, TransportResult};

struct NetworkState {
    /// Listener table: (destination node, topic) → listener channel.
    listeners: HashMap<(NodeId, Topic), MessageListener>,
    /// Destinations currently dropping all inbound sends.
    severed: HashSet<NodeId>,
}

/// Hub shared by all in-process transport endpoints.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

fn lock(state: &Mutex<NetworkState>) -> MutexGuard<'_, NetworkState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                listeners: HashMap::new(),
                severed: HashSet::new(),
            })),
        }
    }

    /// Returns the transport endpoint for `node`.
    #[must_use]
    pub fn endpoint(&self, node: NodeId) -> MemoryTransport {
        MemoryTransport {
            node,
            network: self.clone(),
        }
    }

    /// Drops (or restores) all sends addressed to `node`.
    ///
    /// Topology state is untouched: the node stays alive in discovery,
    /// which makes the "reachable peer, failed send" path testable.
    pub fn sever(&self, node: NodeId, severed: bool) {
        let mut state = lock(&self.state);

        if severed {
            state.severed.insert(node);
        } else {
            state.severed.remove(&node);
        }
    }

    fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        topic: Topic,
        message: Message,
    ) -> TransportResult<()> {
        // Encode/decode round trip: the in-memory path must shake out the
        // same marshalling bugs a socket transport would.
        let mut wire = encode_message(&message)?;
        let message = decode_message(&mut wire)?;

        let state = lock(&self.state);

        if state.severed.contains(&to) {
            return Err(TransportError::SendFailed {
                node: to,
                reason: "route severed".to_string(),
            });
        }

        let Some(listener) = state.listeners.get(&(to, topic)) else {
            return Err(TransportError::UnknownPeer(to));
        };

        listener
            .send((from, message))
            .map_err(|_| TransportError::SendFailed {
                node: to,
                reason: "listener dropped".to_string(),
            })
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's endpoint into a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    node: NodeId,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: NodeId, topic: Topic, message: Message) -> TransportResult<()> {
        self.network.deliver(self.node, to, topic, message)
    }

    fn add_listener(&self, topic: Topic, listener: MessageListener) {
        let replaced = lock(&self.network.state)
            .listeners
            .insert((self.node, topic), listener)
            .is_some();

        if replaced {
            debug!(node = %self.node, ?topic, "replaced existing topic listener");
        }
    }

    fn remove_listener(&self, topic: Topic) {
        lock(&self.network.state)
            .listeners
            .remove(&(self.node, topic));
    }

    fn local_node(&self) -> NodeId {
        self.node
    }
}
