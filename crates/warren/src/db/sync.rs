//! Sync pipeline: one round drains released time-window groups into the
//! data, index and window files with all-or-nothing rollback.
//!
//! Per released time ID: payloads stream into the data writer, slots into
//! the block writer, window entries chain per topic hash through the window
//! writer and the trie tail offset moves forward. The three files flush,
//! the header fsyncs, the cache entries free and the log segment is marked
//! applied. Any failure truncates the files back to their snapshots, rolls
//! the writers back, restores counters and trie offsets, and hands control
//! to recovery.

use super::DbInner;
use crate::data::DataWriter;
use crate::entry::RawEntry;
use crate::error::{Result, StoreError};
use crate::index::{start_block_index, BlockWriter};
use crate::window::writer::WindowWriter;
use crate::window::WinEntry;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use tracing::{debug, error};

#[derive(Debug)]
struct SyncInfo {
    start_block_idx: i32,
    start_window_idx: i32,
    upper_seq: u64,
    count: u64,
    in_bytes: u64,
    win_off: u64,
    block_off: u64,
    data_off: u64,
    complete: bool,
}

/// Runs one sync round. With `recovery` set the round is accounted as a
/// recovery replay and a failure propagates instead of re-recovering.
///
/// Panics if the round fails and the follow-up recovery fails as well; the
/// store is unusable at that point.
pub(crate) fn run(db: &DbInner, recovery: bool) -> Result<()> {
    if db.last_sync_seq.load(Ordering::Acquire) == db.info.seq.load(Ordering::Acquire)
        && !db.time_window.has_pending()
    {
        return Ok(());
    }

    let mut handle = SyncHandle::new(db);
    let result = db
        .time_window
        .foreach_time_window(|time_id, entries| handle.sync_time_id(time_id, entries, recovery));

    match result {
        Ok(()) => {
            handle.finish();
            Ok(())
        }
        Err(e) => {
            error!("sync round failed: {e}");
            if let Err(abort_err) = handle.abort() {
                error!("sync abort failed: {abort_err}");
            }
            handle.finish();
            if recovery {
                return Err(e);
            }
            match super::recovery::start_recovery(db) {
                Ok(()) => Ok(()),
                Err(re) => panic!("unable to recover store after sync error: {re}"),
            }
        }
    }
}

struct SyncHandle<'a> {
    db: &'a DbInner,
    info: SyncInfo,
    window_writer: WindowWriter<'a>,
    block_writer: BlockWriter<'a>,
    data_writer: DataWriter<'a>,
}

impl<'a> SyncHandle<'a> {
    fn new(db: &'a DbInner) -> Self {
        Self {
            info: SyncInfo {
                start_block_idx: db.blocks(),
                start_window_idx: db.time_window.window_index(),
                upper_seq: 0,
                count: 0,
                in_bytes: 0,
                win_off: db.time_window.file().current_size(),
                block_off: db.index.current_size(),
                data_off: db.data.current_size(),
                complete: false,
            },
            window_writer: WindowWriter::new(&db.time_window, db.buf_pool.get()),
            block_writer: BlockWriter::new(&db.index, db.buf_pool.get()),
            data_writer: DataWriter::new(&db.data, &db.free_list, db.buf_pool.get()),
            db,
        }
    }

    fn invalid(&self, n: u64) {
        self.db.meter.entries_invalid.fetch_add(n, Ordering::Relaxed);
    }

    // Moves one released time ID's entries into the writers, flushes, and
    // signals the log segment applied.
    fn sync_time_id(&mut self, time_id: i64, entries: Vec<WinEntry>, recovery: bool) -> Result<()> {
        let db = self.db;
        let mut groups: HashMap<u64, Vec<WinEntry>> = HashMap::new();
        let mut synced: Vec<(u64, u64)> = Vec::new();

        for we in &entries {
            if we.seq == 0 {
                self.invalid(1);
                continue;
            }
            let block_id = start_block_index(we.seq) as u64;
            let key = db.info.cache_id ^ we.seq;
            let Some(raw) = db.cache.get(block_id, key) else {
                // Deleted before sync, or lost; skipped, not fatal.
                self.invalid(1);
                continue;
            };
            let parsed = match RawEntry::decode(&raw) {
                Ok(p) => p,
                Err(_) => {
                    self.invalid(1);
                    continue;
                }
            };
            let mut slot = parsed.slot;
            slot.msg_offset = self.data_writer.append(parsed.message)?;
            if self.block_writer.append(slot, self.info.start_block_idx)? {
                // Duplicate slot: idempotent, free the staged payload.
                db.free_list
                    .free(slot.seq, slot.msg_offset as u64, slot.message_size());
                self.invalid(1);
                continue;
            }
            groups.entry(parsed.topic_hash).or_default().push(*we);
            db.filter.lock().insert(we.seq);
            if we.seq > self.info.upper_seq {
                self.info.upper_seq = we.seq;
            }
            self.info.count += 1;
            self.info.in_bytes += slot.value_size as u64;
            synced.push((block_id, key));
        }

        for (topic_hash, group) in &groups {
            let off = db
                .trie
                .get_offset(*topic_hash)
                .ok_or(StoreError::MissingOffset(*topic_hash))?;
            let new_off = self.window_writer.append(*topic_hash, off, group)?;
            if !db.trie.set_offset(*topic_hash, new_off) {
                return Err(StoreError::MissingOffset(*topic_hash));
            }
        }

        self.flush(recovery)?;
        for (block_id, key) in synced {
            db.cache.free(block_id, key);
        }
        db.wal.signal_log_applied(time_id)?;
        debug!(
            time_id,
            count = self.info.count,
            upper_seq = self.info.upper_seq,
            "time window synced"
        );
        self.reset();
        Ok(())
    }

    // Flushes the three writers and fsyncs data, index, window and header.
    fn flush(&mut self, recovery: bool) -> Result<()> {
        let db = self.db;
        if self.info.upper_seq == 0 {
            return Ok(());
        }
        self.data_writer.write()?;

        let need_blocks = start_block_index(self.info.upper_seq) + 1;
        if need_blocks > db.blocks() {
            db.extend_blocks(need_blocks - db.blocks())?;
        }
        self.window_writer.write()?;
        self.block_writer.write()?;

        db.write_header(None)?;
        db.time_window.file().sync()?;
        db.index.sync()?;
        db.data.sync()?;

        db.incount(self.info.count);
        db.meter.syncs.fetch_add(self.info.count, Ordering::Relaxed);
        db.meter.in_bytes.fetch_add(self.info.in_bytes, Ordering::Relaxed);
        if recovery {
            db.meter.recovers.fetch_add(self.info.count, Ordering::Relaxed);
        }
        self.info.complete = true;
        Ok(())
    }

    // Re-snapshots after a committed time ID so a later failure rolls back
    // only uncommitted work.
    fn reset(&mut self) {
        let db = self.db;
        if self.info.upper_seq > 0 {
            db.last_sync_seq.fetch_max(self.info.upper_seq, Ordering::AcqRel);
        }
        self.info.upper_seq = 0;
        self.info.count = 0;
        self.info.in_bytes = 0;
        self.info.complete = false;
        self.info.start_block_idx = db.blocks();
        self.info.start_window_idx = db.time_window.window_index();
        self.info.win_off = db.time_window.file().current_size();
        self.info.block_off = db.index.current_size();
        self.info.data_off = db.data.current_size();
        self.data_writer.reset();
        self.window_writer.commit();
        self.block_writer.commit();
    }

    // Puts files, counters and trie offsets back to the last snapshot.
    fn abort(&mut self) -> Result<()> {
        let db = self.db;
        if self.info.complete {
            return Ok(());
        }
        db.data.truncate(self.info.data_off)?;
        db.index.truncate(self.info.block_off)?;
        db.time_window.file().truncate(self.info.win_off)?;
        db.info
            .block_idx
            .store(self.info.start_block_idx, Ordering::Release);
        db.time_window.set_window_index(self.info.start_window_idx);
        db.decount(self.info.count);

        for (&topic_hash, &old_off) in self.window_writer.origins() {
            db.trie.force_offset(topic_hash, old_off);
        }

        self.data_writer.rollback()?;
        self.block_writer.rollback()?;
        self.window_writer.rollback()?;
        self.reset();
        Ok(())
    }

    // Hands the pooled buffers back.
    fn finish(self) {
        let Self {
            db,
            window_writer,
            block_writer,
            data_writer,
            ..
        } = self;
        db.buf_pool.put(window_writer.into_buffer());
        db.buf_pool.put(block_writer.into_buffer());
        db.buf_pool.put(data_writer.into_buffer());
    }
}
