//! Data file writer.
//!
//! Message bytes are appended to the data file at sync time. The writer
//! consults the free list for a reclaimed hole of sufficient size before
//! extending the file; fresh appends accumulate in one buffer and flush
//! with a single write.

use crate::error::Result;
use crate::fio::PagedFile;
use crate::freelist::FreeList;

/// Appends message bytes into the data file for one sync round.
#[derive(Debug)]
pub struct DataWriter<'a> {
    file: &'a PagedFile,
    free_list: &'a FreeList,
    buffer: Vec<u8>,
    base_off: u64,
    // Reused holes patched in place at flush: (offset, message bytes).
    leased: Vec<(u64, Vec<u8>)>,
}

impl<'a> DataWriter<'a> {
    /// Creates a writer over the data `file`, borrowing `buffer` from the
    /// pool.
    pub fn new(file: &'a PagedFile, free_list: &'a FreeList, buffer: Vec<u8>) -> Self {
        let base_off = file.current_size();
        Self {
            file,
            free_list,
            buffer,
            base_off,
            leased: Vec::new(),
        }
    }

    /// Consumes the writer and hands the buffer back for pooling.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// Stages `message` for writing and returns its data-file offset.
    pub fn append(&mut self, message: &[u8]) -> Result<i64> {
        if let Some(off) = self.free_list.allocate(message.len() as u32) {
            self.leased.push((off, message.to_vec()));
            return Ok(off as i64);
        }
        let off = self.base_off + self.buffer.len() as u64;
        self.buffer.extend_from_slice(message);
        Ok(off as i64)
    }

    /// Flushes staged bytes: the append run in one write, reused holes in
    /// place. Returns the number of bytes written.
    pub fn write(&mut self) -> Result<usize> {
        let mut written = 0;
        if !self.buffer.is_empty() {
            self.file.write_at(&self.buffer, self.base_off)?;
            written += self.buffer.len();
        }
        for (off, message) in self.leased.drain(..) {
            self.file.write_at(&message, off)?;
            written += message.len();
        }
        Ok(written)
    }

    /// Returns reused holes to the free list and drops staged appends. The
    /// caller truncates the file back to its snapshot.
    pub fn rollback(&mut self) -> Result<()> {
        for (off, message) in self.leased.drain(..) {
            self.free_list.free(0, off, message.len() as u32);
        }
        self.buffer.clear();
        Ok(())
    }

    /// Re-snapshots the append position after a committed round.
    pub fn reset(&mut self) {
        self.base_off = self.file.current_size();
        self.buffer.clear();
        self.leased.clear();
    }
}

/// Reads the payload of a message stored at `msg_offset`: the message bytes
/// are `contract (8) | topic | value`.
pub fn read_value(
    file: &PagedFile,
    msg_offset: i64,
    topic_size: u16,
    value_size: u32,
) -> Result<Vec<u8>> {
    let start = msg_offset as u64 + 8 + topic_size as u64;
    file.slice(start, start + value_size as u64)
}

/// Reads the topic path of a message stored at `msg_offset`.
pub fn read_topic(file: &PagedFile, msg_offset: i64, topic_size: u16) -> Result<Vec<u8>> {
    let start = msg_offset as u64 + 8;
    file.slice(start, start + topic_size as u64)
}

/// Reads the contract of a message stored at `msg_offset`.
pub fn read_contract(file: &PagedFile, msg_offset: i64) -> Result<u64> {
    let buf = file.slice(msg_offset as u64, msg_offset as u64 + 8)?;
    Ok(u64::from_le_bytes(buf.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data_file() -> (TempDir, PagedFile, FreeList) {
        let dir = TempDir::new().unwrap();
        let file = PagedFile::open(dir.path().join("t.data")).unwrap();
        (dir, file, FreeList::new())
    }

    #[test]
    fn test_append_run_flushes_once() {
        let (_dir, file, fl) = data_file();
        let mut w = DataWriter::new(&file, &fl, Vec::new());

        let off_a = w.append(b"alpha").unwrap();
        let off_b = w.append(b"beta").unwrap();
        assert_eq!(off_a, 0);
        assert_eq!(off_b, 5);

        let written = w.write().unwrap();
        assert_eq!(written, 9);
        assert_eq!(file.slice(0, 5).unwrap(), b"alpha");
        assert_eq!(file.slice(5, 9).unwrap(), b"beta");
    }

    #[test]
    fn test_append_reuses_free_hole() {
        let (_dir, file, fl) = data_file();
        file.write_at(&[0u8; 64], 0).unwrap();
        fl.free(1, 16, 10);

        let mut w = DataWriter::new(&file, &fl, Vec::new());
        let off = w.append(b"0123456789").unwrap();
        assert_eq!(off, 16, "hole reused instead of extending");
        w.write().unwrap();
        assert_eq!(file.slice(16, 26).unwrap(), b"0123456789");
        assert_eq!(file.current_size(), 64);
    }

    #[test]
    fn test_rollback_returns_holes() {
        let (_dir, file, fl) = data_file();
        file.write_at(&[0u8; 64], 0).unwrap();
        fl.free(1, 16, 10);

        let mut w = DataWriter::new(&file, &fl, Vec::new());
        w.append(b"0123456789").unwrap();
        assert_eq!(fl.total_bytes(), 0);
        w.rollback().unwrap();
        assert_eq!(fl.total_bytes(), 10);
    }

    #[test]
    fn test_read_helpers() {
        let (_dir, file, fl) = data_file();
        let mut w = DataWriter::new(&file, &fl, Vec::new());

        let mut message = Vec::new();
        message.extend_from_slice(&42u64.to_le_bytes());
        message.extend_from_slice(b"a.b");
        message.extend_from_slice(b"payload");
        let off = w.append(&message).unwrap();
        w.write().unwrap();

        assert_eq!(read_contract(&file, off).unwrap(), 42);
        assert_eq!(read_topic(&file, off, 3).unwrap(), b"a.b");
        assert_eq!(read_value(&file, off, 3, 7).unwrap(), b"payload");
    }
}
