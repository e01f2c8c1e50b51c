//! System limits and configuration bounds.
//!
//! Put limits on everything: every buffer, queue, and retry loop has an
//! explicit maximum. This keeps the loader's memory footprint and retry
//! behaviour predictable.

/// System-wide limits for Trellis.
///
/// All limits are explicit and configurable. Defaults match the loader's
/// standard tuning and are safe for most deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Loader limits.
    /// Default number of entries buffered per destination node before a
    /// batch is submitted.
    pub per_node_buffer_size: usize,
    /// Default number of concurrently outstanding batches per destination.
    pub per_node_parallel_ops: usize,
    /// Maximum number of remap attempts per caller batch before failing.
    pub max_remaps: u32,

    // Wire limits.
    /// Maximum encoded size of a single load request in bytes.
    pub max_request_bytes: u32,
    /// Maximum number of entries in a single load request.
    pub max_entries_per_request: u32,

    // Affinity resolution limits.
    /// Attempts to fetch an affinity descriptor from a remote node.
    pub resolve_retries: u32,
    /// Wait between failed resolve attempts, in milliseconds.
    pub resolve_retry_wait_ms: u64,
    /// Delay before dropping cached affinity for departed caches, in
    /// milliseconds.
    pub affinity_cleanup_delay_ms: u64,
}

impl Limits {
    /// Default per-node buffer size.
    pub const PER_NODE_BUFFER_SIZE_DEFAULT: usize = 1024;

    /// Default per-node parallel operations.
    pub const PER_NODE_PARALLEL_OPS_DEFAULT: usize = 16;

    /// Default remap budget.
    pub const MAX_REMAPS_DEFAULT: u32 = 32;

    /// Default maximum request size (16 MB).
    pub const MAX_REQUEST_BYTES_DEFAULT: u32 = 16 * 1024 * 1024;

    /// Default maximum entries per request.
    pub const MAX_ENTRIES_PER_REQUEST_DEFAULT: u32 = 65_536;

    /// Default resolve retry count.
    pub const RESOLVE_RETRIES_DEFAULT: u32 = 3;

    /// Default wait between resolve retries (ms).
    pub const RESOLVE_RETRY_WAIT_MS_DEFAULT: u64 = 500;

    /// Default affinity cleanup delay (ms). Long enough to ride out a burst
    /// of topology events or a node that briefly disappears.
    pub const AFFINITY_CLEANUP_DELAY_MS_DEFAULT: u64 = 3_000;
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            per_node_buffer_size: Self::PER_NODE_BUFFER_SIZE_DEFAULT,
            per_node_parallel_ops: Self::PER_NODE_PARALLEL_OPS_DEFAULT,
            max_remaps: Self::MAX_REMAPS_DEFAULT,
            max_request_bytes: Self::MAX_REQUEST_BYTES_DEFAULT,
            max_entries_per_request: Self::MAX_ENTRIES_PER_REQUEST_DEFAULT,
            resolve_retries: Self::RESOLVE_RETRIES_DEFAULT,
            resolve_retry_wait_ms: Self::RESOLVE_RETRY_WAIT_MS_DEFAULT,
            affinity_cleanup_delay_ms: Self::AFFINITY_CLEANUP_DELAY_MS_DEFAULT,
        }
    }
}
