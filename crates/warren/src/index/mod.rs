//! Index file: store header plus fixed-slot index blocks.
//!
//! The leading page holds the header; every following page is an index
//! block of [`ENTRIES_PER_INDEX_BLOCK`] slots. A sequence number maps to
//! exactly one block (`(seq - 1) / ENTRIES_PER_INDEX_BLOCK`), so resolving
//! a seq costs one page read and a scan of at most one block.

use crate::entry::{Slot, SLOT_SIZE};
use crate::error::{Result, StoreError};
use crate::fio::{coalesce_blocks, PagedFile, BLOCK_SIZE};
use std::collections::HashMap;

/// Magic bytes identifying a store index file.
pub const MAGIC: [u8; 4] = *b"WRRN";

/// Current on-disk format version.
pub const VERSION: u16 = 1;

/// Slots per 4 KiB index block.
pub const ENTRIES_PER_INDEX_BLOCK: usize = BLOCK_SIZE / SLOT_SIZE;

const ENTRY_IDX_OFF: usize = ENTRIES_PER_INDEX_BLOCK * SLOT_SIZE;

/// Index of the block a sequence number belongs to.
pub fn start_block_index(seq: u64) -> i32 {
    ((seq.saturating_sub(1)) / ENTRIES_PER_INDEX_BLOCK as u64) as i32
}

/// Offset of index block `idx`; the header occupies page zero.
pub fn block_offset(idx: i32) -> u64 {
    (idx as u64 + 1) * BLOCK_SIZE as u64
}

/// Store header persisted in the leading page of the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Format version.
    pub version: u16,
    /// Last assigned sequence number.
    pub seq: u64,
    /// Number of allocated index blocks.
    pub block_idx: i32,
    /// Highest allocated window block index, or -1.
    pub window_idx: i32,
    /// Process-lifetime cache salt recorded at creation.
    pub cache_id: u64,
    /// Offset of the serialized free list in the data file; zero if none.
    pub freelist_off: u64,
    /// Size of the serialized free list.
    pub freelist_size: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            version: VERSION,
            seq: 0,
            block_idx: 0,
            window_idx: -1,
            cache_id: 0,
            freelist_off: 0,
            freelist_size: 0,
        }
    }
}

impl Header {
    /// Serializes the header into a full page.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..14].copy_from_slice(&self.seq.to_le_bytes());
        buf[14..18].copy_from_slice(&self.block_idx.to_le_bytes());
        buf[18..22].copy_from_slice(&self.window_idx.to_le_bytes());
        buf[22..30].copy_from_slice(&self.cache_id.to_le_bytes());
        buf[30..38].copy_from_slice(&self.freelist_off.to_le_bytes());
        buf[38..42].copy_from_slice(&self.freelist_size.to_le_bytes());
        buf
    }

    /// Deserializes and validates a header page.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < 42 {
            return Err(StoreError::Corrupted("header page too short".into()));
        }
        let magic: [u8; 4] = data[..4].try_into().unwrap();
        if magic != MAGIC {
            return Err(StoreError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes(data[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            seq: u64::from_le_bytes(data[6..14].try_into().unwrap()),
            block_idx: i32::from_le_bytes(data[14..18].try_into().unwrap()),
            window_idx: i32::from_le_bytes(data[18..22].try_into().unwrap()),
            cache_id: u64::from_le_bytes(data[22..30].try_into().unwrap()),
            freelist_off: u64::from_le_bytes(data[30..38].try_into().unwrap()),
            freelist_size: u32::from_le_bytes(data[38..42].try_into().unwrap()),
        })
    }
}

/// A 4 KiB page of index slots.
#[derive(Debug, Clone, Copy)]
pub struct IndexBlock {
    /// Slot records; only the first `entry_idx` are meaningful, and a slot
    /// with `seq == 0` inside that range has been deleted.
    pub entries: [Slot; ENTRIES_PER_INDEX_BLOCK],
    /// Number of used slot positions.
    pub entry_idx: u16,

    /// Set while the block has unflushed appends; not persisted.
    pub dirty: bool,
    /// Set when the block was loaded from disk for in-place patching;
    /// not persisted.
    pub leased: bool,
}

impl Default for IndexBlock {
    fn default() -> Self {
        Self {
            entries: [Slot::default(); ENTRIES_PER_INDEX_BLOCK],
            entry_idx: 0,
            dirty: false,
            leased: false,
        }
    }
}

impl IndexBlock {
    /// Serializes the block into a 4 KiB page.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for (i, slot) in self.entries.iter().enumerate() {
            slot.marshal(&mut buf[i * SLOT_SIZE..(i + 1) * SLOT_SIZE]);
        }
        buf[ENTRY_IDX_OFF..ENTRY_IDX_OFF + 2].copy_from_slice(&self.entry_idx.to_le_bytes());
        buf
    }

    /// Deserializes a block from a 4 KiB page.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_SIZE {
            return Err(StoreError::Corrupted("index block too short".into()));
        }
        let mut block = Self::default();
        for (i, slot) in block.entries.iter_mut().enumerate() {
            *slot = Slot::unmarshal(&data[i * SLOT_SIZE..(i + 1) * SLOT_SIZE])?;
        }
        block.entry_idx =
            u16::from_le_bytes(data[ENTRY_IDX_OFF..ENTRY_IDX_OFF + 2].try_into().unwrap());
        Ok(block)
    }

    /// Reads the block at index `idx` from `file`.
    pub fn read(file: &PagedFile, idx: i32) -> Result<Self> {
        let off = block_offset(idx);
        let buf = file.slice(off, off + BLOCK_SIZE as u64)?;
        Self::unmarshal(&buf)
    }

    /// Finds the slot for `seq`, if present.
    pub fn find(&self, seq: u64) -> Option<&Slot> {
        self.entries[..self.entry_idx as usize]
            .iter()
            .find(|s| s.seq == seq && seq != 0)
    }
}

/// Resolves the slot for `seq` from the index file, or `None` if the block
/// is beyond the file or holds no such record.
pub fn read_slot(file: &PagedFile, seq: u64) -> Result<Option<Slot>> {
    if seq == 0 {
        return Ok(None);
    }
    let idx = start_block_index(seq);
    if block_offset(idx) + BLOCK_SIZE as u64 > file.current_size() {
        return Ok(None);
    }
    let block = IndexBlock::read(file, idx)?;
    Ok(block.find(seq).copied())
}

/// Zeroes the slot for `seq` in place. Returns the removed slot, if any.
pub fn clear_slot(file: &PagedFile, seq: u64) -> Result<Option<Slot>> {
    if seq == 0 {
        return Ok(None);
    }
    let idx = start_block_index(seq);
    if block_offset(idx) + BLOCK_SIZE as u64 > file.current_size() {
        return Ok(None);
    }
    let mut block = IndexBlock::read(file, idx)?;
    let Some(pos) = block.entries[..block.entry_idx as usize]
        .iter()
        .position(|s| s.seq == seq)
    else {
        return Ok(None);
    };
    let removed = block.entries[pos];
    block.entries[pos] = Slot::default();
    file.write_at(&block.marshal(), block_offset(idx))?;
    Ok(Some(removed))
}

/// Builds and patches index blocks for one sync round.
#[derive(Debug)]
pub struct BlockWriter<'a> {
    file: &'a PagedFile,
    blocks: HashMap<i32, IndexBlock>,
    leasing: HashMap<i32, Vec<u64>>,
    buffer: Vec<u8>,
}

impl<'a> BlockWriter<'a> {
    /// Creates a writer over the index `file`, borrowing `buffer` from the
    /// pool.
    pub fn new(file: &'a PagedFile, buffer: Vec<u8>) -> Self {
        Self {
            file,
            blocks: HashMap::new(),
            leasing: HashMap::new(),
            buffer,
        }
    }

    /// Consumes the writer and hands the buffer back for pooling.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// Inserts `slot` into the block addressed by its seq. Returns `true`
    /// if the seq is already present (the write is idempotent and the
    /// caller frees the duplicate payload).
    ///
    /// Blocks allocated before this round (`idx < start_block_idx`) are
    /// leased from disk so rollback can remove exactly the added seqs.
    pub fn append(&mut self, slot: Slot, start_block_idx: i32) -> Result<bool> {
        let idx = start_block_index(slot.seq);
        let mut block = match self.blocks.remove(&idx) {
            Some(b) => b,
            None => {
                if idx < start_block_idx
                    && block_offset(idx) + BLOCK_SIZE as u64 <= self.file.current_size()
                {
                    let mut b = IndexBlock::read(self.file, idx)?;
                    b.leased = true;
                    b
                } else {
                    IndexBlock::default()
                }
            }
        };

        if block.find(slot.seq).is_some() {
            self.blocks.insert(idx, block);
            return Ok(true);
        }
        if (block.entry_idx as usize) < ENTRIES_PER_INDEX_BLOCK {
            // Every appended seq is tracked, not only leased-block ones: a
            // block committed by an earlier time ID this round is already
            // on disk, so a later failure must remove exactly these seqs.
            self.leasing.entry(idx).or_default().push(slot.seq);
            let pos = block.entry_idx as usize;
            block.entries[pos] = slot;
            block.entry_idx += 1;
            block.dirty = true;
        }
        self.blocks.insert(idx, block);
        Ok(false)
    }

    /// Flushes dirty blocks: leased blocks are patched in place, the rest
    /// are coalesced into contiguous ranges and written with one call each.
    pub fn write(&mut self) -> Result<()> {
        for (&idx, block) in self.blocks.iter_mut() {
            if !block.leased || !block.dirty {
                continue;
            }
            self.file.write_at(&block.marshal(), block_offset(idx))?;
            block.dirty = false;
        }

        let mut dirty: Vec<i32> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.dirty && !b.leased)
            .map(|(&idx, _)| idx)
            .collect();
        dirty.sort_unstable();

        for (start, end) in coalesce_blocks(&dirty) {
            if start == end {
                let block = self.blocks.get_mut(&start).unwrap();
                self.file.write_at(&block.marshal(), block_offset(start))?;
                block.dirty = false;
                continue;
            }
            self.buffer.clear();
            for idx in start..=end {
                let block = self.blocks.get_mut(&idx).unwrap();
                self.buffer.extend_from_slice(&block.marshal());
                block.dirty = false;
            }
            self.file.write_at(&self.buffer, block_offset(start))?;
        }
        Ok(())
    }

    /// Forgets lease tracking once the round's writes are durable; a later
    /// rollback must not undo committed appends.
    pub fn commit(&mut self) {
        self.leasing.clear();
    }

    /// Removes every seq appended to a leased block in this round.
    pub fn rollback(&mut self) -> Result<()> {
        let leasing = std::mem::take(&mut self.leasing);
        for (idx, seqs) in leasing {
            let off = block_offset(idx);
            if off + BLOCK_SIZE as u64 > self.file.current_size() {
                continue;
            }
            let mut block = IndexBlock::read(self.file, idx)?;
            for seq in seqs {
                let used = block.entry_idx as usize;
                if let Some(pos) = block.entries[..used].iter().position(|s| s.seq == seq) {
                    block.entries.copy_within(pos + 1..used, pos);
                    block.entries[used - 1] = Slot::default();
                    block.entry_idx -= 1;
                }
            }
            self.file.write_at(&block.marshal(), off)?;
        }
        self.blocks.clear();
        Ok(())
    }
}
