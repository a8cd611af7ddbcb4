//! Write-ahead log: timeID-stamped segments in a single `.log` file.
//!
//! Every write batch lives in a segment bound to one time ID. A segment is
//! opened with a stamped marker, filled with CRC-framed records, sealed
//! with a trailer, and finally marked applied once the sync round has made
//! its entries durable in the store files:
//!
//! ```text
//! ┌────────────────┬──────────────────────────────┬────────────────────┐
//! │ open marker    │ records                      │ seal trailer       │
//! │ 0xFFFFFFFF     │ [len u32][crc32 u32][payload]│ [0 u32][sentinel   │
//! │ crc32 | timeID │ ...                          │ u32][upperSeq u64] │
//! │                │                              │ [timeID i64]       │
//! └────────────────┴──────────────────────────────┴────────────────────┘
//! ```
//!
//! Torn bytes at the tail are detected by CRC mismatch and truncated on
//! open; a dangling segment with valid records is sealed in place so its
//! writes survive. Once every segment is applied the file resets to empty.
//!
//! Appends acknowledge durability over a single-shot channel, resolved when
//! the batch commits.

use crate::error::{Result, StoreError};
use crate::fio::PagedFile;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Magic bytes of the log file header.
const LOG_MAGIC: [u8; 4] = *b"WLOG";

/// Log format version.
const LOG_VERSION: u16 = 1;

/// Size of the log file header.
const LOG_HEADER_SIZE: u64 = 16;

/// Marker word opening a segment.
const OPEN_MARK: u32 = 0xffff_ffff;

/// Sentinel of a sealed, not yet applied segment.
const SEAL_SENTINEL: u32 = 0x5ea1_ed00;

/// Sentinel of an applied segment.
const APPLIED_SENTINEL: u32 = 0xacce_97ed;

/// Size of the open marker.
const OPEN_MARK_SIZE: u64 = 16;

/// Size of the seal trailer.
const TRAILER_SIZE: u64 = 24;

/// Fsync policy applied at batch commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each commit (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability; tests only).
    None,
}

/// Configuration for the write-ahead log.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Fsync policy for batch commits.
    pub sync_mode: SyncMode,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Fsync,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    time_id: i64,
    #[allow(dead_code)]
    upper_seq: u64,
    records_start: u64,
    records_end: u64,
    trailer_off: u64,
    applied: bool,
}

#[derive(Debug)]
struct OpenSegment {
    time_id: i64,
    records_start: u64,
    batch: Vec<u8>,
    acks: Vec<Sender<Result<()>>>,
}

#[derive(Debug)]
struct WalInner {
    segments: Vec<Segment>,
    current: Option<OpenSegment>,
    write_off: u64,
    last_time_id: i64,
}

/// The write-ahead log.
#[derive(Debug)]
pub struct Wal {
    file: PagedFile,
    inner: Mutex<WalInner>,
    opts: WalOptions,
}

/// A writer bound to one open segment / time ID.
#[derive(Debug, Clone)]
pub struct LogWriter {
    wal: Arc<Wal>,
    time_id: i64,
}

impl Wal {
    /// Opens the log at `path`. Returns the log and whether recovery is
    /// required (a segment exists without its applied marker).
    pub fn open(path: impl AsRef<Path>, opts: WalOptions) -> Result<(Arc<Self>, bool)> {
        let file = PagedFile::open(path)?;
        if file.current_size() == 0 {
            let mut header = vec![0u8; LOG_HEADER_SIZE as usize];
            header[..4].copy_from_slice(&LOG_MAGIC);
            header[4..6].copy_from_slice(&LOG_VERSION.to_le_bytes());
            file.write_at(&header, 0)?;
            file.sync()?;
        } else {
            let header = file.slice(0, LOG_HEADER_SIZE.min(file.current_size()))?;
            if header.len() < 6 {
                return Err(StoreError::Corrupted("log header too short".into()));
            }
            let magic: [u8; 4] = header[..4].try_into().unwrap();
            if magic != LOG_MAGIC {
                return Err(StoreError::InvalidMagic(magic));
            }
            let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
            if version != LOG_VERSION {
                return Err(StoreError::UnsupportedVersion(version));
            }
        }

        let (segments, write_off) = Self::scan_segments(&file)?;
        if write_off < file.current_size() {
            warn!(
                torn = file.current_size() - write_off,
                "truncating torn bytes at log tail"
            );
            file.truncate(write_off)?;
            file.sync()?;
        }

        let need_recovery = segments.iter().any(|s| !s.applied);
        let last_time_id = segments.iter().map(|s| s.time_id).max().unwrap_or(0);
        let wal = Arc::new(Self {
            file,
            inner: Mutex::new(WalInner {
                segments,
                current: None,
                write_off,
                last_time_id,
            }),
            opts,
        });
        Ok((wal, need_recovery))
    }

    // Walks the file, collecting sealed segments. A dangling open segment
    // with valid records is sealed in place; one without records is
    // dropped. Returns the segments and the end of valid bytes.
    fn scan_segments(file: &PagedFile) -> Result<(Vec<Segment>, u64)> {
        let size = file.current_size();
        let mut segments = Vec::new();
        let mut off = LOG_HEADER_SIZE;
        let mut open: Option<(i64, u64)> = None; // (time_id, records_start)
        let mut open_start = 0u64;

        while off + 8 <= size {
            let head = file.slice(off, off + 8)?;
            let len = u32::from_le_bytes(head[..4].try_into().unwrap());
            let word = u32::from_le_bytes(head[4..8].try_into().unwrap());

            if len == OPEN_MARK {
                if open.is_some() {
                    // Previous segment never sealed; seal it below.
                    break;
                }
                if off + OPEN_MARK_SIZE > size {
                    break;
                }
                let body = file.slice(off + 8, off + OPEN_MARK_SIZE)?;
                let time_id = i64::from_le_bytes(body.try_into().unwrap());
                if crc32fast::hash(&time_id.to_le_bytes()) != word {
                    break;
                }
                open_start = off;
                open = Some((time_id, off + OPEN_MARK_SIZE));
                off += OPEN_MARK_SIZE;
                continue;
            }

            if len == 0 {
                // Seal trailer.
                let Some((time_id, records_start)) = open else {
                    break;
                };
                if word != SEAL_SENTINEL && word != APPLIED_SENTINEL {
                    break;
                }
                if off + TRAILER_SIZE > size {
                    break;
                }
                let body = file.slice(off + 8, off + TRAILER_SIZE)?;
                let upper_seq = u64::from_le_bytes(body[..8].try_into().unwrap());
                let trailer_time_id = i64::from_le_bytes(body[8..16].try_into().unwrap());
                if trailer_time_id != time_id {
                    break;
                }
                segments.push(Segment {
                    time_id,
                    upper_seq,
                    records_start,
                    records_end: off,
                    trailer_off: off,
                    applied: word == APPLIED_SENTINEL,
                });
                open = None;
                off += TRAILER_SIZE;
                continue;
            }

            // Ordinary record.
            if open.is_none() {
                break;
            }
            let end = off + 8 + len as u64;
            if end > size {
                break;
            }
            let payload = file.slice(off + 8, end)?;
            if crc32fast::hash(&payload) != word {
                break;
            }
            off = end;
        }

        // Seal a dangling open segment in place so its acked records
        // survive; an empty one is dropped entirely.
        if let Some((time_id, records_start)) = open {
            if off > records_start {
                let mut trailer = vec![0u8; TRAILER_SIZE as usize];
                trailer[4..8].copy_from_slice(&SEAL_SENTINEL.to_le_bytes());
                trailer[16..24].copy_from_slice(&time_id.to_le_bytes());
                file.write_at(&trailer, off)?;
                file.sync()?;
                segments.push(Segment {
                    time_id,
                    upper_seq: 0,
                    records_start,
                    records_end: off,
                    trailer_off: off,
                    applied: false,
                });
                debug!(time_id, "sealed dangling log segment");
                off += TRAILER_SIZE;
            } else {
                off = open_start;
            }
        }

        Ok((segments, off))
    }

    /// Opens a writer bound to a fresh time ID.
    pub fn new_writer(self: &Arc<Self>) -> Result<LogWriter> {
        let mut inner = self.inner.lock();
        if inner.current.is_some() {
            return Err(StoreError::Log("a log writer is already open".into()));
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let time_id = nanos.max(inner.last_time_id + 1);
        inner.last_time_id = time_id;

        let mut marker = vec![0u8; OPEN_MARK_SIZE as usize];
        marker[..4].copy_from_slice(&OPEN_MARK.to_le_bytes());
        marker[4..8].copy_from_slice(&crc32fast::hash(&time_id.to_le_bytes()).to_le_bytes());
        marker[8..16].copy_from_slice(&time_id.to_le_bytes());
        self.file.write_at(&marker, inner.write_off)?;
        let records_start = inner.write_off + OPEN_MARK_SIZE;
        inner.write_off = records_start;
        inner.current = Some(OpenSegment {
            time_id,
            records_start,
            batch: Vec::new(),
            acks: Vec::new(),
        });
        Ok(LogWriter {
            wal: Arc::clone(self),
            time_id,
        })
    }

    fn sync_by_mode(&self) -> Result<()> {
        match self.opts.sync_mode {
            SyncMode::Fsync | SyncMode::Fdatasync => self.file.sync(),
            SyncMode::None => Ok(()),
        }
    }

    // Flushes the open segment's batch and resolves pending acks.
    fn commit_locked(&self, inner: &mut WalInner) -> Result<()> {
        let Some(current) = inner.current.as_mut() else {
            return Ok(());
        };
        if current.batch.is_empty() && current.acks.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut current.batch);
        let acks = std::mem::take(&mut current.acks);
        let result = (|| -> Result<()> {
            if !batch.is_empty() {
                self.file.write_at(&batch, inner.write_off)?;
            }
            self.sync_by_mode()
        })();
        match &result {
            Ok(()) => {
                inner.write_off += batch.len() as u64;
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                let msg = e.to_string();
                for ack in acks {
                    let _ = ack.send(Err(StoreError::Log(msg.clone())));
                }
            }
        }
        result
    }

    fn append(&self, time_id: i64, payload: &[u8]) -> Result<Receiver<Result<()>>> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.current.as_mut() else {
            return Err(StoreError::Log("no open log writer".into()));
        };
        if current.time_id != time_id {
            return Err(StoreError::Log("log writer is stale".into()));
        }
        let (tx, rx) = bounded(1);
        current
            .batch
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        current
            .batch
            .extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        current.batch.extend_from_slice(payload);
        current.acks.push(tx);
        self.commit_locked(&mut inner)?;
        Ok(rx)
    }

    fn seal(&self, time_id: i64, upper_seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.current.as_ref() else {
            return Err(StoreError::Log("no open log writer".into()));
        };
        if current.time_id != time_id {
            return Err(StoreError::Log("log writer is stale".into()));
        }
        self.commit_locked(&mut inner)?;

        let current = inner.current.take().expect("segment still open");
        let mut trailer = vec![0u8; TRAILER_SIZE as usize];
        trailer[4..8].copy_from_slice(&SEAL_SENTINEL.to_le_bytes());
        trailer[8..16].copy_from_slice(&upper_seq.to_le_bytes());
        trailer[16..24].copy_from_slice(&time_id.to_le_bytes());
        self.file.write_at(&trailer, inner.write_off)?;
        self.file.sync()?;
        let segment = Segment {
            time_id,
            upper_seq,
            records_start: current.records_start,
            records_end: inner.write_off,
            trailer_off: inner.write_off,
            applied: false,
        };
        inner.write_off += TRAILER_SIZE;
        inner.segments.push(segment);
        debug!(time_id, upper_seq, "log segment sealed");
        Ok(())
    }

    // Drops an open segment that received no records, reclaiming its open
    // marker.
    fn abandon(&self, time_id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.current.as_ref() else {
            return Ok(());
        };
        if current.time_id != time_id {
            return Err(StoreError::Log("log writer is stale".into()));
        }
        if !current.batch.is_empty() || current.records_start != inner.write_off {
            return Err(StoreError::Log("cannot abandon a segment with records".into()));
        }
        let current = inner.current.take().expect("segment still open");
        inner.write_off = current.records_start - OPEN_MARK_SIZE;
        self.file.truncate(inner.write_off)?;
        Ok(())
    }

    /// Time IDs of sealed, unapplied segments in order.
    pub fn scan(&self) -> Vec<i64> {
        let inner = self.inner.lock();
        let mut ids: Vec<i64> = inner
            .segments
            .iter()
            .filter(|s| !s.applied)
            .map(|s| s.time_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Reads the records of the segment with `time_id`.
    pub fn read(&self, time_id: i64) -> Result<Vec<Vec<u8>>> {
        let (start, end) = {
            let inner = self.inner.lock();
            let segment = inner
                .segments
                .iter()
                .find(|s| s.time_id == time_id)
                .ok_or_else(|| StoreError::Log(format!("unknown log segment {time_id}")))?;
            (segment.records_start, segment.records_end)
        };
        let mut records = Vec::new();
        let mut off = start;
        while off + 8 <= end {
            let head = self.file.slice(off, off + 8)?;
            let len = u32::from_le_bytes(head[..4].try_into().unwrap()) as u64;
            let crc = u32::from_le_bytes(head[4..8].try_into().unwrap());
            let payload = self.file.slice(off + 8, off + 8 + len)?;
            let actual = crc32fast::hash(&payload);
            if actual != crc {
                return Err(StoreError::ChecksumMismatch {
                    expected: crc,
                    actual,
                });
            }
            records.push(payload);
            off += 8 + len;
        }
        Ok(records)
    }

    /// Marks the segment applied. When every segment is applied and no
    /// writer is open, the log resets to empty.
    pub fn signal_log_applied(&self, time_id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(segment) = inner
            .segments
            .iter_mut()
            .find(|s| s.time_id == time_id)
        else {
            return Err(StoreError::Log(format!("unknown log segment {time_id}")));
        };
        if !segment.applied {
            segment.applied = true;
            let trailer_off = segment.trailer_off;
            self.file
                .write_at(&APPLIED_SENTINEL.to_le_bytes(), trailer_off + 4)?;
            self.sync_by_mode()?;
        }

        if inner.current.is_none() && inner.segments.iter().all(|s| s.applied) {
            inner.segments.clear();
            inner.write_off = LOG_HEADER_SIZE;
            self.file.truncate(LOG_HEADER_SIZE)?;
            self.file.sync()?;
            debug!("log fully applied, reset to empty");
        }
        Ok(())
    }

    /// Flushes any pending batch and fsyncs the file.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.commit_locked(&mut inner)?;
        self.file.sync()
    }
}

impl LogWriter {
    /// Time ID of the segment this writer feeds.
    pub fn time_id(&self) -> i64 {
        self.time_id
    }

    /// Appends a record; the returned channel resolves once the record is
    /// durable per the configured sync mode.
    pub fn append(&self, payload: &[u8]) -> Result<Receiver<Result<()>>> {
        self.wal.append(self.time_id, payload)
    }

    /// Seals the segment with the given upper sequence number.
    pub fn signal_init_write(&self, upper_seq: u64) -> Result<()> {
        self.wal.seal(self.time_id, upper_seq)
    }

    /// Abandons the segment; only valid while it holds no records.
    pub fn abandon(&self) -> Result<()> {
        self.wal.abandon(self.time_id)
    }
}
