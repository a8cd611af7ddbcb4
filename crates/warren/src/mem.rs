//! Block cache holding raw entries that are not yet synced.
//!
//! Entries are keyed by `(block_id, cache_id ^ seq)`. The block ID is the
//! index block the sequence number will land in; the XOR salt makes keys
//! from a previous process lifetime unusable after a reopen. The sync
//! pipeline removes entries once they are durable in the index and data
//! files.

use crate::hash::Consistent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of cache shards; must be a power of two.
const NSHARDS: usize = 16;

type Shard = HashMap<u64, HashMap<u64, Vec<u8>>>;

/// Concurrent map of unsynced raw entries, striped by block ID.
#[derive(Debug)]
pub struct BlockCache {
    shards: Vec<Mutex<Shard>>,
    ring: Consistent,
    bytes: AtomicU64,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            shards: (0..NSHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            ring: Consistent::new(NSHARDS),
            bytes: AtomicU64::new(0),
        }
    }

    fn shard(&self, block_id: u64) -> &Mutex<Shard> {
        &self.shards[self.ring.find_shard(block_id) as usize]
    }

    /// Returns a copy of the entry under `(block_id, key)`, if present.
    pub fn get(&self, block_id: u64, key: u64) -> Option<Vec<u8>> {
        let shard = self.shard(block_id).lock();
        shard.get(&block_id)?.get(&key).cloned()
    }

    /// Inserts an entry under `(block_id, key)`.
    pub fn set(&self, block_id: u64, key: u64, raw: Vec<u8>) {
        let len = raw.len() as u64;
        let mut shard = self.shard(block_id).lock();
        let prev = shard.entry(block_id).or_default().insert(key, raw);
        drop(shard);
        self.bytes.fetch_add(len, Ordering::Relaxed);
        if let Some(prev) = prev {
            self.bytes.fetch_sub(prev.len() as u64, Ordering::Relaxed);
        }
    }

    /// Removes the entry under `(block_id, key)`.
    pub fn free(&self, block_id: u64, key: u64) {
        let mut shard = self.shard(block_id).lock();
        let Some(block) = shard.get_mut(&block_id) else {
            return;
        };
        if let Some(prev) = block.remove(&key) {
            self.bytes.fetch_sub(prev.len() as u64, Ordering::Relaxed);
        }
        if block.is_empty() {
            shard.remove(&block_id);
        }
    }

    /// Approximate bytes held by the cache.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Drops every entry; used when recovery rebuilds the cache from the log.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
        self.bytes.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_free() {
        let cache = BlockCache::new();
        cache.set(1, 100, vec![1, 2, 3]);
        assert_eq!(cache.get(1, 100), Some(vec![1, 2, 3]));
        assert_eq!(cache.get(1, 101), None);
        assert_eq!(cache.get(2, 100), None);

        cache.free(1, 100);
        assert_eq!(cache.get(1, 100), None);
    }

    #[test]
    fn test_byte_accounting() {
        let cache = BlockCache::new();
        cache.set(1, 1, vec![0; 10]);
        cache.set(1, 2, vec![0; 20]);
        assert_eq!(cache.bytes(), 30);

        // Overwrite replaces the old accounting.
        cache.set(1, 1, vec![0; 50]);
        assert_eq!(cache.bytes(), 70);

        cache.free(1, 2);
        assert_eq!(cache.bytes(), 50);

        cache.clear();
        assert_eq!(cache.bytes(), 0);
    }

    #[test]
    fn test_salted_keys_do_not_collide() {
        let cache = BlockCache::new();
        let (salt_a, salt_b) = (0xaaaa_u64, 0xbbbb_u64);
        cache.set(0, salt_a ^ 7, b"a".to_vec());
        cache.set(0, salt_b ^ 7, b"b".to_vec());
        assert_eq!(cache.get(0, salt_a ^ 7), Some(b"a".to_vec()));
        assert_eq!(cache.get(0, salt_b ^ 7), Some(b"b".to_vec()));
    }
}
