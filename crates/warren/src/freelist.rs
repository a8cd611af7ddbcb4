//! Free list of reclaimed data-file regions.
//!
//! Deleted and expired messages leave holes in the data file. The free list
//! tracks them as `(seq, offset, size)` tuples and hands suitable holes back
//! to the data writer before the file is extended.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;

/// A reclaimed region of the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Sequence number the region last belonged to.
    pub seq: u64,
    /// Offset of the region in the data file.
    pub offset: u64,
    /// Size of the region in bytes.
    pub size: u32,
}

const FREE_BLOCK_SIZE: usize = 20; // seq u64 + offset u64 + size u32

/// Thread-safe list of free data-file regions.
#[derive(Debug, Default)]
pub struct FreeList {
    blocks: Mutex<Vec<FreeBlock>>,
}

impl FreeList {
    /// Creates an empty free list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freed region.
    pub fn free(&self, seq: u64, offset: u64, size: u32) {
        if size == 0 {
            return;
        }
        let mut blocks = self.blocks.lock();
        if blocks.iter().any(|b| b.offset == offset) {
            return;
        }
        blocks.push(FreeBlock { seq, offset, size });
    }

    /// Takes a region of at least `size` bytes, if one is available.
    ///
    /// The smallest region that fits is chosen; any remainder stays on the
    /// list.
    pub fn allocate(&self, size: u32) -> Option<u64> {
        let mut blocks = self.blocks.lock();
        let idx = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size >= size)
            .min_by_key(|(_, b)| b.size)
            .map(|(i, _)| i)?;
        let block = blocks[idx];
        if block.size == size {
            blocks.swap_remove(idx);
        } else {
            blocks[idx].offset += size as u64;
            blocks[idx].size -= size;
        }
        Some(block.offset)
    }

    /// Total free bytes currently tracked.
    pub fn total_bytes(&self) -> u64 {
        self.blocks.lock().iter().map(|b| b.size as u64).sum()
    }

    /// Number of tracked regions.
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Returns `true` if no regions are tracked.
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Serializes the list for persistence in the data file.
    pub fn marshal(&self) -> Vec<u8> {
        let blocks = self.blocks.lock();
        let mut buf = Vec::with_capacity(4 + blocks.len() * FREE_BLOCK_SIZE);
        buf.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        for b in blocks.iter() {
            buf.extend_from_slice(&b.seq.to_le_bytes());
            buf.extend_from_slice(&b.offset.to_le_bytes());
            buf.extend_from_slice(&b.size.to_le_bytes());
        }
        buf
    }

    /// Restores the list from a serialized blob.
    pub fn unmarshal(&self, data: &[u8]) -> Result<()> {
        if data.len() < 4 {
            return Err(StoreError::Corrupted("free list blob too short".into()));
        }
        let count = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
        if data.len() < 4 + count * FREE_BLOCK_SIZE {
            return Err(StoreError::Corrupted("free list blob truncated".into()));
        }
        let mut blocks = Vec::with_capacity(count);
        let mut off = 4;
        for _ in 0..count {
            let seq = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
            let offset = u64::from_le_bytes(data[off + 8..off + 16].try_into().unwrap());
            let size = u32::from_le_bytes(data[off + 16..off + 20].try_into().unwrap());
            blocks.push(FreeBlock { seq, offset, size });
            off += FREE_BLOCK_SIZE;
        }
        *self.blocks.lock() = blocks;
        Ok(())
    }
}
