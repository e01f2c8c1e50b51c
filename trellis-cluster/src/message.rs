//! Wire messages for the bulk load protocol.
//!
//! Two messages cross the wire: a [`LoadRequest`] carrying a marshalled
//! entry batch to a destination node, and the [`LoadResponse`] correlating
//! back to it by request id. Entry and updater payloads are opaque blobs
//! produced by the marshaller; the transport never looks inside them.

use bytes::Bytes;
use trellis_core::{CacheName, NodeId, RequestId};

/// A message-addressing topic.
///
/// Requests all travel on the shared [`Topic::Load`] topic; each loader
/// listens for responses on a [`Topic::LoadReply`] topic derived from its
/// local node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Shared request topic served by every node's ingest handler.
    Load,
    /// Per-loader response topic, unique per originating node.
    LoadReply(NodeId),
}

/// How peer-deployed code participates in a request.
///
/// Carried opaquely; the loader never interprets the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    /// Per-request deployment, undeployed with the request originator.
    Private,
    /// Shared within one user version, isolated across versions.
    Isolated,
    /// Shared across all nodes of one user version.
    Shared,
    /// Shared and never undeployed automatically.
    Continuous,
}

/// Opaque peer-deployment metadata piggybacked on a request.
///
/// A reduction of dynamic code-loading metadata to a plain descriptor:
/// receivers that do not support deployment ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentDescriptor {
    /// Deployment mode.
    pub mode: DeployMode,
    /// Fully-qualified name of the deployed type.
    pub class_name: String,
    /// User version of the deployment unit.
    pub user_version: String,
    /// Participating nodes and their loader ids.
    pub participants: Vec<(NodeId, u64)>,
    /// Identifier of the originating class loader.
    pub class_loader_id: u64,
}

/// A batch of entries bound for one destination node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    /// Correlates the response with the originating buffer slot.
    pub req_id: RequestId,
    /// Topic the destination must reply on.
    pub response_topic: Topic,
    /// Target cache.
    pub cache_name: CacheName,
    /// Marshalled updater descriptor.
    pub updater_blob: Bytes,
    /// Marshalled entry batch.
    pub entries_blob: Bytes,
    /// Bypass any write-through store on the destination.
    pub skip_store: bool,
    /// Optional peer-deployment metadata.
    pub deployment: Option<DeploymentDescriptor>,
}

/// Acknowledgement for a [`LoadRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResponse {
    /// The request this responds to.
    pub req_id: RequestId,
    /// Marshalled error, absent on success.
    pub error_blob: Option<Bytes>,
}

/// Any message of the load protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// An entry batch headed to a destination node.
    LoadRequest(LoadRequest),
    /// An acknowledgement headed back to the originator.
    LoadResponse(LoadResponse),
}
