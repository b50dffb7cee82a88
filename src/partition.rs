//! Key partitioning
//!
//! Two different questions are answered here:
//!
//! - which cluster partition owns a key ([`Hasher`]), which must agree on
//!   every node and across restarts, so it never uses a seeded hash;
//! - which local dispatch worker handles a key ([`compute_hash`]), which only
//!   has to be stable inside one process.

use std::hash::{Hash, Hasher as _};

use ahash::AHasher;

use crate::error::ConfigError;

/// Maps an event key to a cluster partition
pub trait Hasher: Send + Sync {
    /// Partition owning `key`. Pure and deterministic.
    fn partition_of(&self, key: &[u8]) -> u32;

    /// Number of partitions this hasher distributes over
    fn partition_count(&self) -> u32;

    /// Partition owning a textual key
    fn partition_of_str(&self, key: &str) -> u32 {
        self.partition_of(key.as_bytes())
    }
}

/// Multiplicative string hash reduced modulo the partition count.
///
/// Uses fixed constants and wrapping 64-bit arithmetic, so every node computes
/// the same partition for the same key regardless of platform or process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultHasher {
    partition_count: u32,
}

impl DefaultHasher {
    const SEED_A: u64 = 63_689;
    const SEED_B: u64 = 378_551;

    /// Create a hasher over `partition_count` partitions
    pub fn new(partition_count: u32) -> Result<Self, ConfigError> {
        if partition_count == 0 {
            return Err(ConfigError::invalid("partition_count", "must be positive"));
        }
        Ok(Self { partition_count })
    }

    fn raw_hash(key: &[u8]) -> u64 {
        let mut a = Self::SEED_A;
        let mut hash: u64 = 0;
        for &byte in key {
            hash = hash.wrapping_mul(a).wrapping_add(u64::from(byte));
            a = a.wrapping_mul(Self::SEED_B);
        }
        hash
    }
}

impl Hasher for DefaultHasher {
    fn partition_of(&self, key: &[u8]) -> u32 {
        (Self::raw_hash(key) % u64::from(self.partition_count)) as u32
    }

    fn partition_count(&self) -> u32 {
        self.partition_count
    }
}

/// Helper to compute an in-process hash for a key
pub fn compute_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = AHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}
