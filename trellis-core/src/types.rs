//! Identifier types shared across the Trellis crates.
//!
//! Node, partition, and request identifiers all travel as 64-bit numbers
//! on the wire, so each gets its own wrapper type: handing a request id to
//! an API that wants a node id should not compile. The wrappers are plain
//! value types with no behaviour beyond construction, access, and
//! formatting.

use std::fmt;

/// Declares a u64-backed identifier wrapper.
///
/// `Display` renders as `tag:value` for log lines; `Debug` keeps the type
/// name so mixed-id dumps stay readable. Raw-value conversions go through
/// `new`/`get` or the `From` impls.
macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $tag:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw identifier value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw identifier value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, ":{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

id_type! {
    /// A member of the cluster.
    NodeId, "node"
}

id_type! {
    /// A slice of a cache's key space.
    PartitionId, "part"
}

id_type! {
    /// Correlates a load request with its response within one buffer.
    RequestId, "req"
}

/// Monotonic counter incremented by the discovery layer on any node
/// membership change.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TopologyVersion(u64);

impl TopologyVersion {
    /// Wraps a raw version counter.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw version counter.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version after one more membership change.
    ///
    /// # Panics
    /// Panics on counter overflow, which a real cluster never reaches.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        assert!(self.0 < u64::MAX, "topology version overflow");
        Self(self.0 + 1)
    }
}

impl fmt::Debug for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopologyVersion({})", self.0)
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topver:{}", self.0)
    }
}

/// Name of a cache hosted by the grid.
///
/// The grid supports an unnamed default cache; `CacheName::default_cache()`
/// stands in for it so the name can be used as a map key everywhere.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheName(String);

/// Internal mask for the unnamed default cache.
const DEFAULT_CACHE_MASK: &str = "<default>";

impl CacheName {
    /// Creates a cache name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name standing in for the unnamed default cache.
    #[must_use]
    pub fn default_cache() -> Self {
        Self(DEFAULT_CACHE_MASK.to_string())
    }

    /// Returns the string form of the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this names the unnamed default cache.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_CACHE_MASK
    }
}

impl fmt::Debug for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache({})", self.0)
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CacheName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_value_round_trip() {
        let id = RequestId::new(7);

        assert_eq!(id.get(), 7);
        assert_eq!(u64::from(id), 7);
        assert_eq!(RequestId::from(7), id);
    }

    #[test]
    fn test_id_formatting() {
        assert_eq!(format!("{}", NodeId::new(3)), "node:3");
        assert_eq!(format!("{:?}", NodeId::new(3)), "NodeId(3)");
        assert_eq!(format!("{}", PartitionId::new(8)), "part:8");
        assert_eq!(format!("{}", RequestId::new(21)), "req:21");
    }

    #[test]
    fn test_ids_order_by_raw_value() {
        let mut requests = vec![RequestId::new(9), RequestId::new(2), RequestId::new(5)];
        requests.sort();

        assert_eq!(
            requests,
            vec![RequestId::new(2), RequestId::new(5), RequestId::new(9)]
        );
    }

    #[test]
    fn test_topology_version_advances() {
        let v1 = TopologyVersion::new(1);
        let v2 = v1.next();

        assert!(v2 > v1);
        assert_eq!(v2.get(), 2);
        assert_eq!(format!("{v2}"), "topver:2");
    }

    #[test]
    fn test_cache_name_default_mask() {
        let named = CacheName::new("orders");
        let default = CacheName::default_cache();

        assert!(!named.is_default());
        assert!(default.is_default());
        assert_ne!(named, default);
        assert_eq!(CacheName::default_cache(), CacheName::default_cache());
    }
}
