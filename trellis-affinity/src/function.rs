//! Affinity functions - key to partition to owner-list mapping.
//!
//! An [`AffinityFunction`] splits the key space into a fixed number of
//! partitions and orders candidate hosting nodes per partition. A
//! [`KeyMapper`] extracts the affinity key from a cache key first, so
//! related keys can be co-located by mapping to the same affinity key.

use std::sync::Arc;

use bytes::Bytes;
use trellis_core::{NodeId, PartitionId};
use xxhash_rust::xxh3::xxh3_64;

/// Default partition count.
pub const PARTITIONS_DEFAULT: u32 = 1024;

/// Extracts the affinity key from a cache key.
pub trait KeyMapper: Send + Sync + 'static {
    /// Returns the affinity key for `key`.
    fn affinity_key(&self, key: &Bytes) -> Bytes;
}

/// Mapper that co-locates nothing: the key is its own affinity key.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl KeyMapper for IdentityMapper {
    fn affinity_key(&self, key: &Bytes) -> Bytes {
        key.clone()
    }
}

/// Maps affinity keys to partitions and partitions to ordered owner lists.
pub trait AffinityFunction: Send + Sync + 'static {
    /// Returns the number of partitions this function splits keys into.
    fn partitions(&self) -> u32;

    /// Returns the partition for an affinity key.
    fn partition(&self, affinity_key: &[u8]) -> PartitionId;

    /// Orders `candidates` (the nodes hosting the cache, sorted by id) by
    /// ownership preference for `partition`. The first node is the primary.
    fn assign(&self, partition: PartitionId, candidates: &[NodeId]) -> Vec<NodeId>;
}

/// Highest-random-weight (rendezvous) affinity.
///
/// Each `(partition, node)` pair gets a deterministic weight; candidates
/// are ordered by descending weight. A node joining or leaving only moves
/// the partitions it wins or held, which keeps remaps small.
#[derive(Debug, Clone, Copy)]
pub struct RendezvousAffinity {
    partitions: u32,
}

impl RendezvousAffinity {
    /// Creates a rendezvous affinity with `partitions` partitions.
    ///
    /// # Panics
    /// Panics if `partitions` is zero.
    #[must_use]
    pub const fn new(partitions: u32) -> Self {
        assert!(partitions > 0, "partitions must be > 0");
        Self { partitions }
    }

    fn weight(partition: PartitionId, node: NodeId) -> u64 {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&partition.get().to_le_bytes());
        buf[8..].copy_from_slice(&node.get().to_le_bytes());
        xxh3_64(&buf)
    }
}

impl Default for RendezvousAffinity {
    fn default() -> Self {
        Self::new(PARTITIONS_DEFAULT)
    }
}

impl AffinityFunction for RendezvousAffinity {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn partition(&self, affinity_key: &[u8]) -> PartitionId {
        PartitionId::new(xxh3_64(affinity_key) % u64::from(self.partitions))
    }

    fn assign(&self, partition: PartitionId, candidates: &[NodeId]) -> Vec<NodeId> {
        let mut owners: Vec<NodeId> = candidates.to_vec();
        owners.sort_by_key(|node| std::cmp::Reverse(Self::weight(partition, *node)));
        owners
    }
}

/// Affinity configuration of one cache: the function plus the key mapper.
#[derive(Clone)]
pub struct AffinityConfig {
    /// The partition/assignment function.
    pub function: Arc<dyn AffinityFunction>,
    /// The affinity-key mapper.
    pub mapper: Arc<dyn KeyMapper>,
}

impl AffinityConfig {
    /// Creates a configuration from a function and a mapper.
    #[must_use]
    pub fn new(function: Arc<dyn AffinityFunction>, mapper: Arc<dyn KeyMapper>) -> Self {
        Self { function, mapper }
    }

    /// Creates the standard configuration: rendezvous affinity over the
    /// default partition count, identity key mapping.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(
            Arc::new(RendezvousAffinity::default()),
            Arc::new(IdentityMapper),
        )
    }
}

impl std::fmt::Debug for AffinityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityConfig")
            .field("partitions", &self.function.partitions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable_and_bounded() {
        let aff = RendezvousAffinity::new(64);

        let p1 = aff.partition(b"some-key");
        let p2 = aff.partition(b"some-key");

        assert_eq!(p1, p2);
        assert!(p1.get() < 64);
    }

    #[test]
    fn test_assign_orders_all_candidates() {
        let aff = RendezvousAffinity::new(64);
        let candidates = vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)];

        let owners = aff.assign(PartitionId::new(7), &candidates);

        assert_eq!(owners.len(), 3);
        for node in &candidates {
            assert!(owners.contains(node));
        }
    }

    #[test]
    fn test_departed_node_only_moves_its_partitions() {
        let aff = RendezvousAffinity::new(256);
        let full = vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)];
        let without_two: Vec<NodeId> = full
            .iter()
            .copied()
            .filter(|n| *n != NodeId::new(2))
            .collect();

        for p in 0..256 {
            let partition = PartitionId::new(p);
            let before = aff.assign(partition, &full);
            let after = aff.assign(partition, &without_two);

            // Partitions not owned by the departed node keep their primary.
            if before[0] != NodeId::new(2) {
                assert_eq!(before[0], after[0], "partition {p} moved needlessly");
            }
        }
    }

    #[test]
    fn test_identity_mapper_passes_key_through() {
        let key = Bytes::from_static(b"k");
        assert_eq!(IdentityMapper.affinity_key(&key), key);
    }
}
