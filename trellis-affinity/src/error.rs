//! Affinity resolution error types.

use thiserror::Error;
use trellis_core::{CacheName, NodeId};

/// Result type for affinity resolution.
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Errors surfaced by the affinity resolver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No node in the current topology hosts the requested cache.
    #[error("no node hosts cache '{cache}' in current topology")]
    NoCacheNode {
        /// The cache that could not be placed.
        cache: CacheName,
    },

    /// The cache is deployed in single-owner local mode and cannot be
    /// mapped remotely.
    #[error("cache '{cache}' is deployed in local mode on {node}")]
    LocalModeMismatch {
        /// The cache in local mode.
        cache: CacheName,
        /// The node hosting it.
        node: NodeId,
    },

    /// Fetching the affinity configuration failed after all retries.
    #[error("failed to fetch affinity for cache '{cache}' after {attempts} attempts: {reason}")]
    ExchangeFailed {
        /// The cache whose configuration was requested.
        cache: CacheName,
        /// Number of attempts made.
        attempts: u32,
        /// Last failure reason.
        reason: String,
    },
}

/// Failure reported by an affinity exchange attempt.
#[derive(Debug, Clone, Error)]
#[error("affinity exchange failed: {reason}")]
pub struct ExchangeError {
    /// Why the exchange failed.
    pub reason: String,
}

impl ExchangeError {
    /// Creates an exchange error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
