//! Process-independent hashing for shard placement and key-hash balancing.
//!
//! `std`'s `DefaultHasher` is randomly seeded per process, which would move
//! keys between shards on every restart. SHA-256 is stable everywhere.

use sha2::{Digest, Sha256};

/// Hashes `key` to a `u64` that is identical across processes and platforms.
pub fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Maps `key` onto one of `buckets` slots.
///
/// Returns `None` when there are no buckets.
pub fn bucket(key: &str, buckets: usize) -> Option<usize> {
    let buckets = u64::try_from(buckets).ok().filter(|b| *b > 0)?;
    usize::try_from(stable_hash(key) % buckets).ok()
}
