//! Consistent hash ring used for lock striping.
//!
//! Shard maps (time-window buckets, the block cache) are split into a fixed
//! number of shards; the ring assigns every 64-bit key to a shard with good
//! spread even when key distributions are skewed.

use std::collections::BTreeMap;

/// Number of virtual points placed on the ring per shard.
const REPLICATION_FACTOR: usize = 20;

/// Consistent hash over a fixed set of shards.
#[derive(Debug)]
pub struct Consistent {
    ring: BTreeMap<u64, u32>,
    shards: u32,
}

impl Consistent {
    /// Builds a ring for `shards` shards.
    pub fn new(shards: usize) -> Self {
        let mut ring = BTreeMap::new();
        for shard in 0..shards {
            for point in 0..REPLICATION_FACTOR {
                let key = (shard as u64) << 32 | point as u64;
                ring.insert(hash64(key), shard as u32);
            }
        }
        Self {
            ring,
            shards: shards as u32,
        }
    }

    /// Returns the shard for `key`.
    pub fn find_shard(&self, key: u64) -> u32 {
        let point = hash64(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &shard)| shard)
            .unwrap_or(0)
    }

    /// Returns the number of shards on the ring.
    pub fn shard_count(&self) -> u32 {
        self.shards
    }
}

/// Hashes a 64-bit key onto the ring.
fn hash64(key: u64) -> u64 {
    xxhash_rust::xxh64::xxh64(&key.to_le_bytes(), 0)
}
