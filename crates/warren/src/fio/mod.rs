//! Paged file abstraction and buffer pool.
//!
//! All three store files (index, data, window summary) are grown in
//! block-sized extensions and written with positioned I/O, so a single
//! writer and any number of readers can share one handle without seeking.

use crate::error::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of an on-disk block (index, data extension and window blocks).
pub const BLOCK_SIZE: usize = 4096;

/// A file written in block-sized pages with positioned reads and writes.
///
/// The current logical size is tracked in memory so appends are constant
/// time and rollback can truncate back to a snapshot.
#[derive(Debug)]
pub struct PagedFile {
    file: File,
    size: AtomicU64,
}

impl PagedFile {
    /// Opens or creates the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size: AtomicU64::new(size),
        })
    }

    /// Returns the current logical size in bytes.
    pub fn current_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Writes `buf` at the given offset, growing the tracked size if the
    /// write extends the file.
    pub fn write_at(&self, buf: &[u8], off: u64) -> Result<()> {
        self.file.write_all_at(buf, off)?;
        let end = off + buf.len() as u64;
        let mut size = self.size.load(Ordering::Acquire);
        while end > size {
            match self
                .size
                .compare_exchange_weak(size, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(s) => size = s,
            }
        }
        Ok(())
    }

    /// Reads the byte range `[start, end)` into a fresh buffer.
    pub fn slice(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (end - start) as usize];
        self.file.read_exact_at(&mut buf, start)?;
        Ok(buf)
    }

    /// Grows the file by `by` bytes of zeroes and returns the offset of the
    /// extension.
    pub fn extend(&self, by: u64) -> Result<u64> {
        let off = self.size.fetch_add(by, Ordering::AcqRel);
        self.file.set_len(off + by)?;
        Ok(off)
    }

    /// Truncates the file to `size` bytes.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    /// Flushes file contents and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Pool of reusable byte buffers for batching block writes.
///
/// Buffers handed back keep their capacity, so steady-state sync rounds
/// allocate nothing.
#[derive(Debug, Default)]
pub struct BufferPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a cleared buffer from the pool, allocating if none is free.
    pub fn get(&self) -> Vec<u8> {
        let mut buf = self.bufs.lock().pop().unwrap_or_default();
        buf.clear();
        buf
    }

    /// Returns a buffer to the pool.
    pub fn put(&self, buf: Vec<u8>) {
        self.bufs.lock().push(buf);
    }
}

/// Coalesces a sorted list of block indices into inclusive contiguous
/// ranges, so runs of sequential appends flush with one write each.
pub fn coalesce_blocks(sorted: &[i32]) -> Vec<(i32, i32)> {
    let mut ranges = Vec::new();
    let mut iter = sorted.iter().copied();
    let Some(first) = iter.next() else {
        return ranges;
    };
    let (mut start, mut end) = (first, first);
    for idx in iter {
        if idx == end + 1 {
            end = idx;
        } else {
            ranges.push((start, end));
            start = idx;
            end = idx;
        }
    }
    ranges.push((start, end));
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let f = PagedFile::open(dir.path().join("t.data")).unwrap();

        f.write_at(b"hello world", 0).unwrap();
        assert_eq!(f.current_size(), 11);

        let buf = f.slice(6, 11).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_extend_and_truncate() {
        let dir = TempDir::new().unwrap();
        let f = PagedFile::open(dir.path().join("t.data")).unwrap();

        let off = f.extend(BLOCK_SIZE as u64).unwrap();
        assert_eq!(off, 0);
        assert_eq!(f.current_size(), BLOCK_SIZE as u64);

        let off = f.extend(BLOCK_SIZE as u64).unwrap();
        assert_eq!(off, BLOCK_SIZE as u64);

        f.truncate(BLOCK_SIZE as u64).unwrap();
        assert_eq!(f.current_size(), BLOCK_SIZE as u64);
    }

    #[test]
    fn test_size_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.data");
        {
            let f = PagedFile::open(&path).unwrap();
            f.write_at(&[7u8; 100], 0).unwrap();
            f.sync().unwrap();
        }
        let f = PagedFile::open(&path).unwrap();
        assert_eq!(f.current_size(), 100);
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        buf.extend_from_slice(&[1, 2, 3]);
        let cap = buf.capacity();
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn test_coalesce_blocks() {
        assert!(coalesce_blocks(&[]).is_empty());
        assert_eq!(coalesce_blocks(&[3]), vec![(3, 3)]);
        assert_eq!(
            coalesce_blocks(&[0, 1, 2, 5, 7, 8]),
            vec![(0, 2), (5, 5), (7, 8)]
        );
    }
}
