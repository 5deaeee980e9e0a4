//! Hash functions used to place topics and virtual positions on the ring.

use std::fmt::Debug;

use twox_hash::XxHash64;

/// Maps bytes onto the 64-bit hash space of the ring.
///
/// Implementations must be stable across processes: every node of a cluster
/// has to compute the same value for the same key.
pub trait TopicHasher: Debug + Send + Sync + 'static {
    /// Hash the given key.
    fn hash(&self, key: &[u8]) -> u64;
}

/// Default hasher: 64-bit xxHash with a fixed seed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XxTopicHasher {
    seed: u64,
}

impl XxTopicHasher {
    /// Create a hasher with a custom seed.
    ///
    /// All nodes of a cluster must agree on the seed.
    #[must_use]
    pub const fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

impl TopicHasher for XxTopicHasher {
    fn hash(&self, key: &[u8]) -> u64 {
        XxHash64::oneshot(self.seed, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let a = XxTopicHasher::default();
        let b = XxTopicHasher::default();

        assert_eq!(a.hash(b"hello"), b.hash(b"hello"));
        assert_ne!(a.hash(b"hello"), a.hash(b"world"));
    }

    #[test]
    fn test_seed_changes_hash() {
        let a = XxTopicHasher::default();
        let b = XxTopicHasher::with_seed(42);

        assert_ne!(a.hash(b"hello"), b.hash(b"hello"));
    }
}
