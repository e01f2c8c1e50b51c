//! Trellis Cluster - environment collaborators for the data loader.
//!
//! This crate provides the contracts the loader and the affinity resolver
//! depend on, plus in-process implementations used by tests and embeddings:
//!
//! - **Discovery**: local node identity, node enumeration, liveness checks,
//!   and a topology event stream ([`Discovery`], [`ClusterRegistry`])
//! - **Transport**: topic-addressed message delivery between nodes
//!   ([`Transport`], [`MemoryNetwork`])
//! - **Wire messages**: the load request/response protocol and its binary
//!   codec ([`Message`], [`codec`])
//!
//! Discovery protocols themselves are out of scope; the registry is the
//! in-process stand-in that fires the same events a real discovery layer
//! would.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
mod discovery;
mod memory;
mod message;
mod registry;
mod transport;

pub use discovery::{CacheMode, Discovery, NodeInfo, TopologyEvent, TopologyEventKind};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{DeployMode, DeploymentDescriptor, LoadRequest, LoadResponse, Message, Topic};
pub use registry::ClusterRegistry;
pub use transport::{MessageListener, Transport, TransportError, TransportResult};
