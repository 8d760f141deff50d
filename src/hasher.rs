//! Bucket routing hash.
//!
//! Static-bucket tables route a record by hashing the order-preserving
//! encoding of its bucket key. The hash must be stable across platforms and
//! releases because `total-buckets` recorded in manifests pins the routing of
//! already-written files; CRC64 gives that stability without pulling in a
//! hashing crate.

use crc::{Crc, CRC_64_ECMA_182};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Hashes an encoded bucket key.
pub fn bucket_hash(key: &[u8]) -> u64 {
    CRC64.checksum(key)
}

/// Maps a bucket-key hash onto one of `total` buckets.
pub fn bucket_of(hash: u64, total: u32) -> u32 {
    (hash % u64::from(total)) as u32
}
