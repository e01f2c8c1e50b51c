//! Loader error types.
//!
//! `NodeLeft` is the one retryable condition: the engine consumes it
//! internally and remaps the affected entries, up to the remap budget.
//! Everything else fails the caller's completion directly.

use thiserror::Error;
use trellis_core::{CacheName, NodeId};

use trellis_affinity::ResolveError;

/// Result type for loader operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Completion handle for one batch, resolved exactly once when the
/// destination has applied or rejected it.
pub type BatchCompletion = trellis_core::Completion<LoadError>;

/// Errors surfaced by the data loader.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// A submission arrived after the loader was closed.
    #[error("data loader has been closed")]
    LoaderClosed,

    /// No node hosts the target cache at mapping time.
    #[error("failed to map keys to nodes (no nodes with cache '{cache}' in topology)")]
    NoTopology {
        /// The cache with no hosting nodes.
        cache: CacheName,
    },

    /// The destination left the topology before acknowledging. Retryable:
    /// drives a remap inside the engine.
    #[error("failed to wait for request completion (node has left): {node}")]
    NodeLeft {
        /// The departed node.
        node: NodeId,
    },

    /// The remap budget was exhausted.
    #[error("failed to finish operation (too many remaps): {remaps}")]
    TooManyRemaps {
        /// Remaps attempted.
        remaps: u32,
    },

    /// The destination's updater rejected the batch.
    #[error("updater failed on destination: {message}")]
    UpdaterError {
        /// Decoded updater failure.
        message: String,
    },

    /// A request or response could not be marshalled. Not retryable.
    #[error("marshalling failed: {message}")]
    MarshalError {
        /// What went wrong.
        message: String,
    },

    /// A send failed while the destination was still alive and reachable.
    #[error("failed to send request to {node}: {reason}")]
    SendFailed {
        /// The destination node.
        node: NodeId,
        /// The underlying transport failure.
        reason: String,
    },

    /// The loader was closed with cancellation while work was outstanding.
    #[error("data loader has been cancelled")]
    Cancelled,

    /// Affinity resolution failed.
    #[error(transparent)]
    Resolver(#[from] ResolveError),

    /// An argument failed validation.
    #[error(transparent)]
    Invalid(#[from] trellis_core::Error),
}

impl LoadError {
    /// Returns true if the engine may remap the affected entries instead of
    /// failing the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeLeft { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_node_left_is_retryable() {
        assert!(LoadError::NodeLeft {
            node: NodeId::new(1)
        }
        .is_retryable());

        assert!(!LoadError::Cancelled.is_retryable());
        assert!(!LoadError::TooManyRemaps { remaps: 32 }.is_retryable());
        assert!(!LoadError::MarshalError {
            message: String::new()
        }
        .is_retryable());
    }
}
