//! Window writer: builds and patches window blocks during a sync round.
//!
//! Blocks touched in the round live in an in-memory map until `write`
//! flushes them. Blocks loaded from disk for appending are `leased`; the
//! writer remembers which seqs were added to a leased block so `rollback`
//! can remove exactly those without truncating the file.

use super::{
    win_block_index, win_block_offset, TimeWindowBucket, WinBlock, WinEntry,
    SEQS_PER_WINDOW_BLOCK,
};
use crate::error::Result;
use crate::fio::coalesce_blocks;
use std::collections::HashMap;

/// Builds window blocks for one sync round.
#[derive(Debug)]
pub struct WindowWriter<'a> {
    bucket: &'a TimeWindowBucket,
    win_blocks: HashMap<i32, WinBlock>,
    leasing: HashMap<i32, Vec<u64>>,
    // Tail offset each topic had before its first append this round, so an
    // abort can put the trie back where it was.
    origins: HashMap<u64, i64>,
    buffer: Vec<u8>,
}

impl<'a> WindowWriter<'a> {
    /// Creates a writer over `bucket`, borrowing `buffer` from the pool.
    pub fn new(bucket: &'a TimeWindowBucket, buffer: Vec<u8>) -> Self {
        Self {
            bucket,
            win_blocks: HashMap::new(),
            leasing: HashMap::new(),
            origins: HashMap::new(),
            buffer,
        }
    }

    /// Consumes the writer and hands the buffer back for pooling.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// Appends `entries` for `topic_hash` to the chain ending at `off`
    /// (zero if the topic has no persisted block yet) and returns the new
    /// tail offset.
    ///
    /// Seqs already present in the target block are skipped, making the
    /// append idempotent. A full block is stamped with the current time as
    /// its cutoff and a fresh block is chained in front of it.
    pub fn append(&mut self, topic_hash: u64, off: i64, entries: &[WinEntry]) -> Result<i64> {
        self.origins.entry(topic_hash).or_insert(off);
        let mut win_idx;
        let mut block;
        if off == 0 {
            win_idx = self.bucket.next_window_index();
            block = self.win_blocks.remove(&win_idx).unwrap_or_default();
        } else {
            win_idx = win_block_index(off);
            match self.win_blocks.remove(&win_idx) {
                Some(b) => block = b,
                None => {
                    let file = self.bucket.file();
                    let end = off as u64 + crate::fio::BLOCK_SIZE as u64;
                    if win_idx <= self.bucket.window_index() && end <= file.current_size() {
                        block = WinBlock::read(file, off as u64)?;
                        block.validate(topic_hash)?;
                        block.leased = true;
                    } else {
                        block = WinBlock::default();
                    }
                }
            }
        }
        block.topic_hash = topic_hash;

        for we in entries {
            if we.seq == 0 {
                continue;
            }
            if block.entries[..block.entry_idx as usize]
                .iter()
                .any(|e| e.seq == we.seq)
            {
                continue;
            }
            if block.entry_idx as usize == SEQS_PER_WINDOW_BLOCK {
                let next = win_block_offset(win_idx) as i64;
                block.cutoff = crate::message::unix_now() as i64;
                block.dirty = true;
                self.win_blocks.insert(win_idx, block);
                win_idx = self.bucket.next_window_index();
                block = WinBlock {
                    topic_hash,
                    next,
                    ..Default::default()
                };
            }
            // Every appended seq is tracked, not only leased-block ones: a
            // block committed by an earlier time ID this round is already
            // on disk, so a later failure must remove exactly these seqs.
            self.leasing.entry(win_idx).or_default().push(we.seq);
            block.entries[block.entry_idx as usize] = *we;
            block.dirty = true;
            block.entry_idx += 1;
        }

        self.win_blocks.insert(win_idx, block);
        Ok(win_block_offset(win_idx) as i64)
    }

    /// Flushes dirty blocks: leased blocks are patched in place, the rest
    /// are coalesced into contiguous ranges and written with one call each.
    pub fn write(&mut self) -> Result<()> {
        let file = self.bucket.file();
        for (&idx, block) in self.win_blocks.iter_mut() {
            if !block.leased || !block.dirty {
                continue;
            }
            file.write_at(&block.marshal(), win_block_offset(idx))?;
            block.dirty = false;
        }

        let mut dirty: Vec<i32> = self
            .win_blocks
            .iter()
            .filter(|(_, b)| b.dirty && !b.leased)
            .map(|(&idx, _)| idx)
            .collect();
        dirty.sort_unstable();

        for (start, end) in coalesce_blocks(&dirty) {
            if start == end {
                let block = self.win_blocks.get_mut(&start).unwrap();
                file.write_at(&block.marshal(), win_block_offset(start))?;
                block.dirty = false;
                continue;
            }
            self.buffer.clear();
            for idx in start..=end {
                let block = self.win_blocks.get_mut(&idx).unwrap();
                self.buffer.extend_from_slice(&block.marshal());
                block.dirty = false;
            }
            file.write_at(&self.buffer, win_block_offset(start))?;
        }
        Ok(())
    }

    /// Forgets lease tracking once the round's writes are durable; a later
    /// rollback must not undo committed appends.
    pub fn commit(&mut self) {
        self.leasing.clear();
        self.origins.clear();
    }

    /// Pre-round tail offset of every topic touched since the last commit.
    pub fn origins(&self) -> &HashMap<u64, i64> {
        &self.origins
    }

    /// Removes every seq appended to a leased block in this round, undoing
    /// the in-place patches that `write` may have flushed.
    pub fn rollback(&mut self) -> Result<()> {
        let leasing = std::mem::take(&mut self.leasing);
        for (idx, seqs) in leasing {
            for seq in seqs {
                self.del(seq, idx)?;
            }
        }
        self.win_blocks.clear();
        Ok(())
    }

    /// Deletes `seq` from the block at index `idx`, shifting later entries
    /// left and rewriting the block. Blocks beyond the (possibly
    /// truncated) file are gone already and need no patching.
    fn del(&self, seq: u64, idx: i32) -> Result<()> {
        let file = self.bucket.file();
        let off = win_block_offset(idx);
        if off + crate::fio::BLOCK_SIZE as u64 > file.current_size() {
            return Ok(());
        }
        let mut block = WinBlock::read(file, off)?;
        let used = block.entry_idx as usize;
        let Some(pos) = block.entries[..used].iter().position(|e| e.seq == seq) else {
            return Ok(());
        };
        block.entries.copy_within(pos + 1..used, pos);
        block.entries[used - 1] = WinEntry::default();
        block.entry_idx -= 1;
        file.write_at(&block.marshal(), off)?;
        Ok(())
    }
}
