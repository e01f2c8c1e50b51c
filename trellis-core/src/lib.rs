//! Trellis Core - Strongly-typed identifiers and shared primitives.
//!
//! This crate provides the types shared by every Trellis crate: typed IDs,
//! the cache `Entry` data model, explicit resource limits, and the
//! [`Completion`] promise primitive that the loader pipeline is built on.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: prevent mixing up `NodeId` with `RequestId`
//! - **Explicit limits**: every buffer and queue has a bounded maximum
//! - **No unsafe code**: safety > performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod completion;
mod entry;
mod error;
mod limits;
mod types;

pub use completion::Completion;
pub use entry::Entry;
pub use error::{Error, Result};
pub use limits::Limits;
pub use types::{CacheName, NodeId, PartitionId, RequestId, TopologyVersion};
