//! Transport contract - topic-addressed message delivery between nodes.
//!
//! The loader sends requests and receives responses through this trait.
//! Listener registration is channel-based: a component registers an
//! unbounded sender for a topic and consumes `(source, message)` pairs from
//! the paired receiver on its own task.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use trellis_core::NodeId;

use crate::codec::CodecError;
use crate::message::{Message, Topic};

/// Messages delivered to a topic listener, tagged with the source node.
pub type MessageListener = mpsc::UnboundedSender<(NodeId, Message)>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination node is not reachable through this transport.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// The destination was reachable but refused or dropped the message.
    #[error("send to {node} failed: {reason}")]
    SendFailed {
        /// The destination node.
        node: NodeId,
        /// Why the send failed.
        reason: String,
    },

    /// The message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Trait for message delivery between cluster nodes.
///
/// Implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a message to `to` on `topic`.
    ///
    /// # Errors
    /// Returns an error if the peer is unknown, the message cannot be
    /// encoded, or delivery fails.
    async fn send(&self, to: NodeId, topic: Topic, message: Message) -> TransportResult<()>;

    /// Registers a listener for a topic on the local node.
    ///
    /// A later registration for the same topic replaces the earlier one.
    fn add_listener(&self, topic: Topic, listener: MessageListener);

    /// Removes the listener for a topic, if any.
    fn remove_listener(&self, topic: Topic);

    /// Returns the node this transport instance belongs to.
    fn local_node(&self) -> NodeId;
}
