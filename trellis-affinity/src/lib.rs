//! Trellis Affinity - key to owning-node resolution.
//!
//! Maps a cache key to the node that owns it at the current topology
//! version. The resolver maintains one lazily-resolved affinity snapshot per
//! cache: the first caller performs the resolution (locally or by fetching
//! the affinity configuration from a remote hosting node), later callers
//! share the same snapshot. Topology changes invalidate snapshots after a
//! short delay so event bursts don't thrash the cache.
//!
//! # Resolution pipeline
//!
//! ```text
//! key ──mapper──▶ affinity key ──function──▶ partition ──assign──▶ owner
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod function;
mod resolver;
mod snapshot;

pub use error::{ExchangeError, ResolveError, ResolveResult};
pub use function::{AffinityConfig, AffinityFunction, IdentityMapper, KeyMapper, RendezvousAffinity};
pub use resolver::{AffinityExchange, AffinityResolver, StaticAffinityExchange};
pub use snapshot::AffinitySnapshot;
