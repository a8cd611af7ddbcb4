//! Time-window summary: pending entry buckets and the on-disk window file.
//!
//! Unsynced entries are grouped in memory by `(time_id, topic_hash)`; the
//! sync round drains released time IDs into 4 KiB window blocks chained
//! newest-to-oldest per topic hash. A window block:
//!
//! ```text
//! ┌──────────────────────────────────────────┬──────────────────────────┐
//! │ entries[SEQS_PER_WINDOW_BLOCK]           │ trailer                  │
//! │ each: seq u64 | expiresAt u32 (12 bytes) │ cutoff i64 | topicHash   │
//! │                                          │ u64 | next i64 | entryIdx│
//! │                                          │ u16                      │
//! └──────────────────────────────────────────┴──────────────────────────┘
//! ```
//!
//! `next` points at a strictly lower (older) block offset or zero, so a
//! backward walk from the tail terminates. `cutoff` is stamped only when a
//! block fills and rolls over; partially filled blocks keep `cutoff = 0`
//! and are treated as newest.

pub mod writer;

use crate::error::{Result, StoreError};
use crate::fio::{PagedFile, BLOCK_SIZE};
use crate::hash::Consistent;
use crate::message::unix_now;
use crate::timemark::TimeMark;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

/// Size of one serialized window entry.
pub const WIN_ENTRY_SIZE: usize = 12;

/// Size of the window block trailer.
pub const WIN_TRAILER_SIZE: usize = 26;

/// Window entries per 4 KiB block.
pub const SEQS_PER_WINDOW_BLOCK: usize = (BLOCK_SIZE - WIN_TRAILER_SIZE) / WIN_ENTRY_SIZE;

/// Number of pending-entry shards.
const NSHARDS: usize = 16;

/// The minimal record carried through the time window, trie ring and
/// window file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WinEntry {
    /// Sequence number of the message.
    pub seq: u64,
    /// Expiry as unix seconds; zero means no TTL.
    pub expires_at: u32,
}

impl WinEntry {
    /// Returns `true` if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at != 0 && self.expires_at <= unix_now()
    }
}

/// A 4 KiB page of window entries for a single topic hash.
#[derive(Debug, Clone, Copy)]
pub struct WinBlock {
    /// Topic hash every entry in the block belongs to.
    pub topic_hash: u64,
    /// Entry slots; only the first `entry_idx` are valid.
    pub entries: [WinEntry; SEQS_PER_WINDOW_BLOCK],
    /// Offset of the next (older) block in the chain, or zero.
    pub next: i64,
    /// Approximate unix second of the newest entry; zero until the block
    /// fills and rolls over.
    pub cutoff: i64,
    /// Number of used entry slots.
    pub entry_idx: u16,

    /// Set while the block has unflushed appends; not persisted.
    pub dirty: bool,
    /// Set when the block was loaded from disk for in-place patching;
    /// not persisted.
    pub leased: bool,
}

impl Default for WinBlock {
    fn default() -> Self {
        Self {
            topic_hash: 0,
            entries: [WinEntry::default(); SEQS_PER_WINDOW_BLOCK],
            next: 0,
            cutoff: 0,
            entry_idx: 0,
            dirty: false,
            leased: false,
        }
    }
}

impl WinBlock {
    /// Returns `true` if the block predates the query cutoff, meaning the
    /// backward walk can stop here.
    pub fn past_cutoff(&self, cutoff: i64) -> bool {
        self.cutoff != 0 && self.cutoff < cutoff
    }

    /// Validates that the block belongs to `topic_hash`.
    pub fn validate(&self, topic_hash: u64) -> Result<()> {
        if self.topic_hash != topic_hash {
            return Err(StoreError::WindowValidation {
                block: self.topic_hash,
                expected: topic_hash,
            });
        }
        Ok(())
    }

    /// Serializes the block into a 4 KiB page.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut off = 0;
        for e in &self.entries {
            buf[off..off + 8].copy_from_slice(&e.seq.to_le_bytes());
            buf[off + 8..off + 12].copy_from_slice(&e.expires_at.to_le_bytes());
            off += WIN_ENTRY_SIZE;
        }
        buf[off..off + 8].copy_from_slice(&self.cutoff.to_le_bytes());
        buf[off + 8..off + 16].copy_from_slice(&self.topic_hash.to_le_bytes());
        buf[off + 16..off + 24].copy_from_slice(&self.next.to_le_bytes());
        buf[off + 24..off + 26].copy_from_slice(&self.entry_idx.to_le_bytes());
        buf
    }

    /// Deserializes a block from a 4 KiB page.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_SIZE {
            return Err(StoreError::Corrupted("window block too short".into()));
        }
        let mut block = Self::default();
        let mut off = 0;
        for e in block.entries.iter_mut() {
            e.seq = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
            e.expires_at = u32::from_le_bytes(data[off + 8..off + 12].try_into().unwrap());
            off += WIN_ENTRY_SIZE;
        }
        block.cutoff = i64::from_le_bytes(data[off..off + 8].try_into().unwrap());
        block.topic_hash = u64::from_le_bytes(data[off + 8..off + 16].try_into().unwrap());
        block.next = i64::from_le_bytes(data[off + 16..off + 24].try_into().unwrap());
        block.entry_idx = u16::from_le_bytes(data[off + 24..off + 26].try_into().unwrap());
        Ok(block)
    }

    /// Reads the block stored at `offset` in `file`.
    pub fn read(file: &PagedFile, offset: u64) -> Result<Self> {
        let buf = file.slice(offset, offset + BLOCK_SIZE as u64)?;
        Self::unmarshal(&buf)
    }
}

/// Offset of window block `idx` in the window file.
///
/// The leading page of the file is reserved so a block offset is never
/// zero; zero marks both "no persisted entries" in the trie and the end of
/// a block chain.
pub fn win_block_offset(idx: i32) -> u64 {
    (idx as u64 + 1) * BLOCK_SIZE as u64
}

/// Inverse of [`win_block_offset`].
pub fn win_block_index(off: i64) -> i32 {
    (off / BLOCK_SIZE as i64 - 1) as i32
}

/// Tuning for release aging and background expiry.
#[derive(Debug, Clone)]
pub struct TimeOptions {
    /// Age a time ID must reach after its last unref before it is released.
    pub max_duration: Duration,
    /// Base tick of the expiry worker.
    pub exp_duration: Duration,
    /// Multiplier on the expiry tick.
    pub max_exp_durations: usize,
}

impl Default for TimeOptions {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(1),
            exp_duration: Duration::from_secs(60),
            max_exp_durations: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct WinKey {
    time_id: i64,
    topic_hash: u64,
}

type Shard = HashMap<WinKey, Vec<WinEntry>>;

/// Side bucket of entries seen expired during lookups; drained by the
/// expiry worker.
#[derive(Debug, Default)]
pub struct ExpiryBucket {
    entries: Mutex<BTreeMap<u32, Vec<WinEntry>>>,
}

impl ExpiryBucket {
    /// Records an expired entry. Duplicates are tolerated; the free list
    /// ignores double frees.
    pub fn add(&self, entry: WinEntry) {
        self.entries
            .lock()
            .entry(entry.expires_at)
            .or_default()
            .push(entry);
    }

    /// Pops up to `limit` entries whose expiry has passed.
    pub fn get_expired(&self, limit: usize) -> Vec<WinEntry> {
        let now = unix_now();
        let mut entries = self.entries.lock();
        let mut out = Vec::new();
        while out.len() < limit {
            let Some((&at, _)) = entries.iter().next() else {
                break;
            };
            if at > now {
                break;
            }
            let bucket = entries.get_mut(&at).unwrap();
            while out.len() < limit {
                match bucket.pop() {
                    Some(e) => out.push(e),
                    None => break,
                }
            }
            if bucket.is_empty() {
                entries.remove(&at);
            }
        }
        out
    }
}

/// Sharded bucket of unsynced window entries plus the window file itself.
#[derive(Debug)]
pub struct TimeWindowBucket {
    file: PagedFile,
    window_idx: AtomicI32,
    shards: Vec<Mutex<Shard>>,
    ring: Consistent,
    time_mark: TimeMark,
    expiry: ExpiryBucket,
    opts: TimeOptions,
}

impl TimeWindowBucket {
    /// Creates a bucket over the window `file`.
    pub fn new(file: PagedFile, opts: TimeOptions) -> Self {
        Self {
            file,
            window_idx: AtomicI32::new(-1),
            shards: (0..NSHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            ring: Consistent::new(NSHARDS),
            time_mark: TimeMark::new(),
            expiry: ExpiryBucket::default(),
            opts,
        }
    }

    /// The window file.
    pub fn file(&self) -> &PagedFile {
        &self.file
    }

    /// The release tracker.
    pub fn time_mark(&self) -> &TimeMark {
        &self.time_mark
    }

    /// The expiry side bucket.
    pub fn expiry(&self) -> &ExpiryBucket {
        &self.expiry
    }

    /// Highest allocated window block index, or -1.
    pub fn window_index(&self) -> i32 {
        self.window_idx.load(Ordering::Acquire)
    }

    /// Sets the highest allocated window block index.
    pub fn set_window_index(&self, idx: i32) {
        self.window_idx.store(idx, Ordering::Release);
    }

    /// Allocates the next window block index.
    pub fn next_window_index(&self) -> i32 {
        self.window_idx.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn shard(&self, topic_hash: u64) -> &Mutex<Shard> {
        &self.shards[self.ring.find_shard(topic_hash) as usize]
    }

    /// Appends a pending entry under `(time_id, topic_hash)`.
    pub fn add(&self, time_id: i64, topic_hash: u64, entry: WinEntry) {
        let key = WinKey {
            time_id,
            topic_hash,
        };
        self.shard(topic_hash).lock().entry(key).or_default().push(entry);
    }

    /// Removes a pending entry, if present. Used by the delete path.
    pub fn remove(&self, topic_hash: u64, seq: u64) -> bool {
        let mut shard = self.shard(topic_hash).lock();
        for (key, entries) in shard.iter_mut() {
            if key.topic_hash != topic_hash {
                continue;
            }
            if let Some(pos) = entries.iter().position(|e| e.seq == seq) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Collects up to `limit` unsynced entries for `topic_hash`, newest
    /// first. Expired entries are diverted to the expiry bucket.
    ///
    /// The result length is explicitly clamped to `limit`.
    pub fn ilookup(&self, topic_hash: u64, limit: usize) -> Vec<WinEntry> {
        let shard = self.shard(topic_hash).lock();
        let mut keys: Vec<&WinKey> = shard
            .keys()
            .filter(|k| k.topic_hash == topic_hash && !self.time_mark.is_aborted(k.time_id))
            .collect();
        // Newest time IDs first; within one group entries are append-ordered
        // so they are walked from the back.
        keys.sort_unstable_by(|a, b| b.time_id.cmp(&a.time_id));

        let mut out = Vec::new();
        for key in keys {
            if out.len() >= limit {
                break;
            }
            for e in shard[key].iter().rev() {
                if out.len() >= limit {
                    break;
                }
                if e.is_expired() {
                    self.expiry.add(*e);
                    continue;
                }
                out.push(*e);
            }
        }
        out
    }

    /// Collects up to `limit` entries for `topic_hash`, newest first:
    /// unsynced entries first, then the persisted window chain starting at
    /// `tail_off`, walking `next` backwards.
    ///
    /// The walk stops when the limit is reached, when a block predates
    /// `cutoff`, or when a chained block belongs to a different topic hash.
    pub fn lookup(&self, topic_hash: u64, tail_off: i64, cutoff: i64, limit: usize) -> Vec<WinEntry> {
        let mut out = self.ilookup(topic_hash, limit);
        if out.len() >= limit || tail_off <= 0 {
            return out;
        }
        let mut off = tail_off;
        loop {
            let block = match WinBlock::read(&self.file, off as u64) {
                Ok(b) => b,
                Err(_) => return out,
            };
            if block.topic_hash != topic_hash {
                return out;
            }
            for e in block.entries[..block.entry_idx as usize].iter().rev() {
                if out.len() >= limit {
                    return out;
                }
                if e.seq == 0 {
                    continue;
                }
                if e.is_expired() {
                    self.expiry.add(*e);
                    continue;
                }
                out.push(*e);
            }
            if block.past_cutoff(cutoff) || block.next == 0 || block.next >= off {
                return out;
            }
            off = block.next;
        }
    }

    /// Drains released time IDs, oldest first, invoking `f(time_id,
    /// entries)` for each. Groups are deleted only after `f` succeeds; the
    /// first failure stops the pass.
    ///
    /// The releaser sweep runs lazily at the start of every pass.
    pub fn foreach_time_window<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(i64, Vec<WinEntry>) -> Result<()>,
    {
        self.time_mark.run_releaser(self.opts.max_duration);

        let mut time_ids: Vec<i64> = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for key in shard.keys() {
                if !time_ids.contains(&key.time_id) {
                    time_ids.push(key.time_id);
                }
            }
        }
        time_ids.sort_unstable();

        for time_id in time_ids {
            if !self.time_mark.is_released(time_id) {
                continue;
            }
            let mut entries = Vec::new();
            for shard in &self.shards {
                let shard = shard.lock();
                for (key, group) in shard.iter() {
                    if key.time_id == time_id {
                        entries.extend_from_slice(group);
                    }
                }
            }
            if entries.is_empty() {
                self.time_mark.remove(time_id);
                continue;
            }
            f(time_id, entries)?;
            for shard in &self.shards {
                shard.lock().retain(|key, _| key.time_id != time_id);
            }
            self.time_mark.remove(time_id);
        }
        Ok(())
    }

    /// Unwinds aborted time IDs: invokes `f` on each group, then deletes it.
    pub fn abort_pending<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[WinEntry]) -> Result<()>,
    {
        for time_id in self.time_mark.aborted_ids() {
            for shard in &self.shards {
                let mut shard = shard.lock();
                let keys: Vec<WinKey> = shard
                    .keys()
                    .filter(|k| k.time_id == time_id)
                    .copied()
                    .collect();
                for key in keys {
                    if let Some(group) = shard.get(&key) {
                        f(group)?;
                    }
                    shard.remove(&key);
                }
            }
            self.time_mark.remove(time_id);
        }
        Ok(())
    }

    /// Drops every pending group. Recovery rebuilds them from the log.
    pub fn clear_pending(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    /// Returns `true` if any pending groups exist.
    pub fn has_pending(&self) -> bool {
        self.shards.iter().any(|s| !s.lock().is_empty())
    }

    /// Walks the persisted window blocks in file order, invoking `f(block,
    /// offset)` for every block with at least one entry. Blocks with
    /// `entry_idx == 0` are skipped; rollback legitimately leaves chained
    /// empty blocks behind. `f` returning `true` stops the walk.
    pub fn foreach_window_block<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&WinBlock, u64) -> Result<bool>,
    {
        let n = self.window_index();
        for idx in 0..=n {
            let off = win_block_offset(idx);
            if off + BLOCK_SIZE as u64 > self.file.current_size() {
                break;
            }
            let block = WinBlock::read(&self.file, off)?;
            if block.entry_idx == 0 {
                continue;
            }
            if f(&block, off)? {
                break;
            }
        }
        Ok(())
    }
}
