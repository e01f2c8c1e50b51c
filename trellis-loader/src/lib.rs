//! Trellis Loader - bulk ingestion into a partitioned cache.
//!
//! The loader is an asynchronous, per-destination-node batching pipeline:
//! entries are mapped to their owning nodes through the affinity resolver,
//! coalesced into bounded per-node buffers, and dispatched with bounded
//! parallelism. Topology changes remap in-flight entries to new owners, up
//! to a bounded remap budget.
//!
//! Delivery semantics are at-least-once with idempotent updaters: entries
//! destined for one node apply in order within one batch, but there is no
//! ordering across batches or across keys.
//!
//! # Example shape
//!
//! ```text
//! caller ──add_data──▶ partition ──▶ Buffer::update ──(size/time)──▶ submit
//!        ◀─completion── per-batch ◀── Buffer::on_response ◀── transport
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod buffer;
mod error;
mod loader;
mod marshal;
mod receiver;
mod scheduler;
mod store;
mod updater;

pub use error::{BatchCompletion, LoadError, LoadResult};
pub use loader::DataLoader;
pub use receiver::IngestReceiver;
pub use scheduler::FlushScheduler;
pub use store::CacheStore;
pub use updater::Updater;
