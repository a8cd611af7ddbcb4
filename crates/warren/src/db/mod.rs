//! The store: public API, query engine and lifecycle.
//!
//! A store is four files under `dir/<name>.{idx,data,win,log}` plus the
//! in-memory structures that make them fast: the block cache of unsynced
//! entries, the topic trie, the time-window bucket and the seq filter.
//!
//! Writes go cache → log → window bucket and become durable in a sync
//! round; reads go trie → ring/window chain → cache-or-index → data file.

mod recovery;
mod sync;

use crate::data;
use crate::entry::{encode_raw, RawEntry, Slot};
use crate::error::{Result, StoreError};
use crate::filter::SeqFilter;
use crate::fio::{BufferPool, PagedFile, BLOCK_SIZE};
use crate::freelist::FreeList;
use crate::index::{self, start_block_index, Header};
use crate::mem::BlockCache;
use crate::message::{
    unix_now, Contract, Entry, MessageId, Query, Topic, DEFAULT_CONTRACT,
};
use crate::options::Options;
use crate::trie::TopicTrie;
use crate::wal::{LogWriter, Wal};
use crate::window::{TimeOptions, TimeWindowBucket, WinEntry};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Counters kept while the store is open.
#[derive(Debug, Default)]
pub struct Meter {
    puts: AtomicU64,
    gets: AtomicU64,
    syncs: AtomicU64,
    recovers: AtomicU64,
    in_bytes: AtomicU64,
    entries_invalid: AtomicU64,
}

/// A snapshot of store counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Messages accepted since open.
    pub puts: u64,
    /// Queries served since open.
    pub gets: u64,
    /// Entries made durable by sync rounds.
    pub syncs: u64,
    /// Entries made durable by recovery rounds.
    pub recovers: u64,
    /// Payload bytes made durable.
    pub in_bytes: u64,
    /// Entries skipped as invalid during sync.
    pub entries_invalid: u64,
    /// Messages currently accounted live.
    pub msg_count: u64,
    /// Bytes tracked by the data-file free list.
    pub free_bytes: u64,
    /// Bytes held in the block cache.
    pub cache_bytes: u64,
}

#[derive(Debug)]
struct DbInfo {
    seq: AtomicU64,
    count: AtomicU64,
    block_idx: AtomicI32,
    cache_id: u64,
}

#[derive(Debug)]
struct Session {
    writer: LogWriter,
    appends: u64,
}

pub(crate) struct DbInner {
    opts: Options,
    index: PagedFile,
    data: PagedFile,
    time_window: TimeWindowBucket,
    wal: Arc<Wal>,
    trie: TopicTrie,
    cache: BlockCache,
    filter: Mutex<SeqFilter>,
    free_list: FreeList,
    buf_pool: BufferPool,
    info: DbInfo,
    meter: Meter,
    sync_lock: Mutex<()>,
    session: Mutex<Option<Session>>,
    sealed_ids: Mutex<Vec<i64>>,
    last_sync_seq: AtomicU64,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    close_tx: Mutex<Option<Sender<()>>>,
}

/// An embedded append-optimized pub/sub message store.
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Opens (or creates) the store `name` under `options.dir`.
    ///
    /// If the write-ahead log reports unapplied segments, recovery replays
    /// them and runs a sync round before the store accepts writes.
    pub fn open(name: &str, options: Options) -> Result<Self> {
        std::fs::create_dir_all(&options.dir)?;
        let path = |ext: &str| -> PathBuf { options.dir.join(format!("{name}.{ext}")) };

        let index = PagedFile::open(path("idx"))?;
        let data = PagedFile::open(path("data"))?;
        let win = PagedFile::open(path("win"))?;

        let header = if index.current_size() == 0 {
            let header = Header {
                cache_id: rand::random(),
                ..Default::default()
            };
            index.extend(BLOCK_SIZE as u64)?;
            index.write_at(&header.marshal(), 0)?;
            index.sync()?;
            header
        } else {
            let page = index.slice(0, BLOCK_SIZE as u64)?;
            Header::unmarshal(&page)?
        };

        let mut header = header;
        let free_list = FreeList::new();
        if header.freelist_off > 0 {
            let blob = data.slice(
                header.freelist_off,
                header.freelist_off + header.freelist_size as u64,
            )?;
            free_list.unmarshal(&blob)?;
            // The blob sits at the data tail; reclaim the space and clear
            // the header reference so a crash before the next sync does
            // not leave it pointing past the file.
            data.truncate(header.freelist_off)?;
            header.freelist_off = 0;
            header.freelist_size = 0;
            index.write_at(&header.marshal(), 0)?;
            index.sync()?;
        }

        let time_window = TimeWindowBucket::new(
            win,
            TimeOptions {
                max_duration: options.log_release_duration,
                exp_duration: options.exp_duration,
                max_exp_durations: options.max_exp_durations,
            },
        );
        time_window.set_window_index(header.window_idx);

        let (wal, need_recovery) = Wal::open(path("log"), options.wal.clone())?;

        // Clamp the block count to what the file actually holds.
        let file_blocks = (index.current_size() / BLOCK_SIZE as u64) as i32 - 1;
        let block_idx = header.block_idx.min(file_blocks.max(0));

        let inner = Arc::new(DbInner {
            trie: TopicTrie::new(options.ring_cap),
            filter: Mutex::new(SeqFilter::new(options.filter_capacity)),
            index,
            data,
            time_window,
            wal,
            cache: BlockCache::new(),
            free_list,
            buf_pool: BufferPool::new(),
            info: DbInfo {
                seq: AtomicU64::new(header.seq),
                count: AtomicU64::new(0),
                block_idx: AtomicI32::new(block_idx),
                cache_id: header.cache_id,
            },
            meter: Meter::default(),
            sync_lock: Mutex::new(()),
            session: Mutex::new(None),
            sealed_ids: Mutex::new(Vec::new()),
            last_sync_seq: AtomicU64::new(header.seq),
            closed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            close_tx: Mutex::new(None),
            opts: options,
        });

        inner.warm_trie()?;

        if need_recovery {
            info!(store = name, "log has unapplied segments, recovering");
            recovery::start_recovery(&inner)?;
        }

        inner.start_workers(&inner);
        debug!(
            store = name,
            seq = inner.info.seq.load(Ordering::Acquire),
            "store opened"
        );
        Ok(Self { inner })
    }

    /// Publishes `payload` to `topic` and returns the assigned message ID.
    pub fn put(
        &self,
        topic: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<MessageId> {
        self.put_entry(Entry::new(topic, payload))
    }

    /// Publishes a prepared entry.
    pub fn put_entry(&self, entry: Entry) -> Result<MessageId> {
        self.inner.put_entry(entry)
    }

    /// Deletes the message named by the entry's ID. Requires the `mutable`
    /// option.
    pub fn delete_entry(&self, entry: Entry) -> Result<()> {
        self.inner.delete_entry(entry)
    }

    /// Returns matching payloads, newest first.
    pub fn get(&self, query: Query) -> Result<Vec<Vec<u8>>> {
        self.inner.get(query)
    }

    /// Mints a message ID carrying a fresh sequence number.
    pub fn new_id(&self) -> MessageId {
        self.inner.new_id()
    }

    /// Mints a fresh non-default contract.
    pub fn new_contract(&self) -> Contract {
        loop {
            let contract: Contract = rand::random();
            if contract != 0 && contract != DEFAULT_CONTRACT {
                return contract;
            }
        }
    }

    /// Forces a sync round, making all accepted writes durable.
    pub fn sync(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.sync_now()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Flushes everything and shuts down background workers. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            warn!("failed to close store cleanly: {e}");
        }
    }
}

impl DbInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.info.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn new_id(&self) -> MessageId {
        MessageId::new(self.info.cache_id as u32, self.next_seq())
    }

    pub(crate) fn blocks(&self) -> i32 {
        self.info.block_idx.load(Ordering::Acquire)
    }

    pub(crate) fn extend_blocks(&self, n: i32) -> Result<()> {
        self.index.extend(n as u64 * BLOCK_SIZE as u64)?;
        self.info.block_idx.fetch_add(n, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn incount(&self, n: u64) {
        self.info.count.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn decount(&self, n: u64) {
        let mut count = self.info.count.load(Ordering::Relaxed);
        loop {
            let next = count.saturating_sub(n);
            match self.info.count.compare_exchange_weak(
                count,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(c) => count = c,
            }
        }
    }

    /// Persists the header page. `freelist` carries the blob location when
    /// the free list was just serialized (at close).
    pub(crate) fn write_header(&self, freelist: Option<(u64, u32)>) -> Result<()> {
        let (freelist_off, freelist_size) = freelist.unwrap_or((0, 0));
        let header = Header {
            seq: self.info.seq.load(Ordering::Acquire),
            block_idx: self.blocks(),
            window_idx: self.time_window.window_index(),
            cache_id: self.info.cache_id,
            freelist_off,
            freelist_size,
            ..Default::default()
        };
        self.index.write_at(&header.marshal(), 0)
    }

    // Opens the write session lazily; every session maps to one log
    // segment and one time ID.
    fn session_writer(&self) -> Result<LogWriter> {
        let mut guard = self.session.lock();
        if let Some(session) = guard.as_mut() {
            session.appends += 1;
            return Ok(session.writer.clone());
        }
        let writer = self.wal.new_writer()?;
        self.time_window.time_mark().add(writer.time_id());
        *guard = Some(Session {
            writer: writer.clone(),
            appends: 1,
        });
        Ok(writer)
    }

    // Seals the current session. With `force`, its time ID (and any
    // earlier sealed ones) release immediately; otherwise release waits
    // out the log release duration.
    pub(crate) fn seal_session(&self, force: bool) -> Result<()> {
        let mut guard = self.session.lock();
        if let Some(session) = guard.take() {
            let time_id = session.writer.time_id();
            let time_mark = self.time_window.time_mark();
            if session.appends == 0 {
                session.writer.abandon()?;
                time_mark.release(time_id);
                time_mark.remove(time_id);
            } else {
                session
                    .writer
                    .signal_init_write(self.info.seq.load(Ordering::Acquire))?;
                time_mark.release(time_id);
                self.sealed_ids.lock().push(time_id);
            }
        }
        drop(guard);
        if force {
            let time_mark = self.time_window.time_mark();
            for time_id in self.sealed_ids.lock().drain(..) {
                time_mark.release_now(time_id);
            }
        }
        Ok(())
    }

    fn put_entry(&self, entry: Entry) -> Result<MessageId> {
        self.ensure_open()?;
        let contract = entry.contract.unwrap_or(DEFAULT_CONTRACT);
        let topic = Topic::parse(&entry.topic, contract)?;

        let id = match entry.id {
            Some(id) => {
                if id.seq() == 0 {
                    return Err(StoreError::InvalidEntry("id carries no seq".into()));
                }
                self.info.seq.fetch_max(id.seq(), Ordering::AcqRel);
                id
            }
            None => self.new_id(),
        };
        let seq = id.seq();
        let expires_at = entry
            .ttl
            .or(topic.ttl)
            .map(|ttl| unix_now() + ttl.as_secs() as u32)
            .unwrap_or(0);

        let raw = encode_raw(
            seq,
            expires_at,
            topic.hash,
            contract,
            &topic.path,
            &entry.payload,
        );
        let block_id = start_block_index(seq) as u64;
        let key = self.info.cache_id ^ seq;
        self.cache.set(block_id, key, raw.clone());

        let committed = self.session_writer().and_then(|writer| {
            let ack = writer.append(&raw)?;
            match ack.recv() {
                Ok(result) => result.map(|()| writer),
                Err(_) => Err(StoreError::Log("append ack dropped".into())),
            }
        });
        let writer = match committed {
            Ok(writer) => writer,
            Err(e) => {
                self.cache.free(block_id, key);
                return Err(e);
            }
        };

        let we = WinEntry { seq, expires_at };
        self.trie
            .add_topic(contract, topic.hash, &topic.parts, topic.depth);
        self.trie.add(contract, topic.hash, we);
        self.time_window.add(writer.time_id(), topic.hash, we);
        self.meter.puts.fetch_add(1, Ordering::Relaxed);

        // Backpressure: an oversized cache forces a sync before returning.
        if self.cache.bytes() > self.opts.mem_size {
            self.sync_now()?;
        }
        Ok(id)
    }

    fn delete_entry(&self, entry: Entry) -> Result<()> {
        self.ensure_open()?;
        if !self.opts.mutable {
            return Err(StoreError::Immutable);
        }
        let Some(id) = entry.id else {
            return Err(StoreError::InvalidEntry("delete requires an id".into()));
        };
        let seq = id.seq();
        if seq == 0 {
            return Err(StoreError::InvalidEntry("id carries no seq".into()));
        }
        let contract = entry.contract.unwrap_or(DEFAULT_CONTRACT);
        let topic = Topic::parse(&entry.topic, contract)?;

        self.trie.remove(contract, topic.hash, seq);
        self.time_window.remove(topic.hash, seq);
        self.cache
            .free(start_block_index(seq) as u64, self.info.cache_id ^ seq);
        // The in-place slot clear must not race a sync round rewriting the
        // same block.
        let _guard = self.sync_lock.lock();
        if let Some(slot) = index::clear_slot(&self.index, seq)? {
            self.free_list
                .free(seq, slot.msg_offset as u64, slot.message_size());
            self.decount(1);
        }
        Ok(())
    }

    fn get(&self, query: Query) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        let contract = query.contract.unwrap_or(DEFAULT_CONTRACT);
        let topic = Topic::parse(&query.topic, contract)?;
        let limit = query
            .limit
            .or(topic.limit)
            .unwrap_or(self.opts.default_query_limit)
            .min(self.opts.max_query_limit);
        let cutoff = topic
            .last
            .map(|last| unix_now() as i64 - last.as_secs() as i64)
            .unwrap_or(0);

        let mut entries: Vec<WinEntry> = Vec::new();
        for matched in self.trie.lookup(contract, &topic.parts, limit) {
            entries.extend(matched.entries);
            entries.extend(self.time_window.lookup(
                matched.topic_hash,
                matched.offset,
                cutoff,
                limit,
            ));
        }
        entries.sort_unstable_by(|a, b| b.seq.cmp(&a.seq));
        entries.dedup_by_key(|e| e.seq);

        let now = unix_now();
        let mut out = Vec::new();
        for we in entries {
            if out.len() >= limit {
                break;
            }
            let Some((slot, value)) = self.read_entry(we.seq)? else {
                continue;
            };
            if slot.is_expired(now) {
                self.time_window.expiry().add(WinEntry {
                    seq: slot.seq,
                    expires_at: slot.expires_at,
                });
                continue;
            }
            out.push(value);
        }
        self.meter.gets.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    // Resolves one seq: the block cache first, then index + data files.
    fn read_entry(&self, seq: u64) -> Result<Option<(Slot, Vec<u8>)>> {
        let block_id = start_block_index(seq) as u64;
        if let Some(raw) = self.cache.get(block_id, self.info.cache_id ^ seq) {
            let e = RawEntry::decode(&raw)?;
            return Ok(Some((e.slot, e.value().to_vec())));
        }
        match index::read_slot(&self.index, seq)? {
            Some(slot) => {
                let value = data::read_value(
                    &self.data,
                    slot.msg_offset,
                    slot.topic_size,
                    slot.value_size,
                )?;
                Ok(Some((slot, value)))
            }
            None => Ok(None),
        }
    }

    fn sync_now(&self) -> Result<()> {
        self.seal_session(true)?;
        let _guard = self.sync_lock.lock();
        sync::run(self, false)
    }

    fn background_sync(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.seal_session(false)?;
        let _guard = self.sync_lock.lock();
        sync::run(self, false)
    }

    // One expiry pass: pop expired entries seen by lookups and reclaim
    // their slots and data regions.
    fn expire_entries(&self) -> Result<()> {
        let _guard = self.sync_lock.lock();
        let expired = self
            .time_window
            .expiry()
            .get_expired(self.opts.default_query_limit);
        for we in expired {
            if !self.filter.lock().maybe_contains(we.seq) {
                continue;
            }
            if let Some(slot) = index::clear_slot(&self.index, we.seq)? {
                self.free_list
                    .free(slot.seq, slot.msg_offset as u64, slot.message_size());
                self.decount(1);
            }
        }
        Ok(())
    }

    // Rebuilds trie offsets from the persisted window chains: for every
    // topic hash, the highest-offset block is its tail; the stored topic
    // bytes give the parts back.
    fn warm_trie(&self) -> Result<()> {
        let mut tails: HashMap<u64, u64> = HashMap::new();
        self.time_window.foreach_window_block(|block, off| {
            let tail = tails.entry(block.topic_hash).or_insert(off);
            if off > *tail {
                *tail = off;
            }
            Ok(false)
        })?;
        if tails.is_empty() {
            return Ok(());
        }

        let mut restored = 0usize;
        for (topic_hash, tail_off) in tails {
            let block = crate::window::WinBlock::read(self.time_window.file(), tail_off)?;
            // Any live entry of the tail block names the topic bytes.
            for we in &block.entries[..block.entry_idx as usize] {
                let Some(slot) = index::read_slot(&self.index, we.seq)? else {
                    continue;
                };
                let raw_topic = data::read_topic(&self.data, slot.msg_offset, slot.topic_size)?;
                let contract = data::read_contract(&self.data, slot.msg_offset)?;
                let Ok(topic) = Topic::parse(&raw_topic, contract) else {
                    warn!(topic_hash, "skipping unparsable persisted topic");
                    break;
                };
                self.trie
                    .add_topic(contract, topic.hash, &topic.parts, topic.depth);
                self.trie.set_offset(topic.hash, tail_off as i64);
                restored += 1;
                break;
            }
        }
        debug!(topics = restored, "trie warmed from window file");
        Ok(())
    }

    fn start_workers(&self, inner: &Arc<DbInner>) {
        let (tx, rx) = bounded::<()>(0);
        *self.close_tx.lock() = Some(tx);

        let mut workers = self.workers.lock();
        workers.push(spawn_worker(
            Arc::clone(inner),
            rx.clone(),
            self.opts.sync_interval,
            |db| {
                if let Err(e) = db.background_sync() {
                    error!("background sync failed: {e}");
                }
            },
        ));
        let exp_interval = self.opts.exp_duration * self.opts.max_exp_durations.max(1) as u32;
        workers.push(spawn_worker(Arc::clone(inner), rx, exp_interval, |db| {
            if let Err(e) = db.expire_entries() {
                error!("expiry pass failed: {e}");
            }
        }));
    }

    fn stats(&self) -> Stats {
        Stats {
            puts: self.meter.puts.load(Ordering::Relaxed),
            gets: self.meter.gets.load(Ordering::Relaxed),
            syncs: self.meter.syncs.load(Ordering::Relaxed),
            recovers: self.meter.recovers.load(Ordering::Relaxed),
            in_bytes: self.meter.in_bytes.load(Ordering::Relaxed),
            entries_invalid: self.meter.entries_invalid.load(Ordering::Relaxed),
            msg_count: self.info.count.load(Ordering::Relaxed),
            free_bytes: self.free_list.total_bytes(),
            cache_bytes: self.cache.bytes(),
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Stop workers before the final round so nothing races it.
        drop(self.close_tx.lock().take());
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }

        self.seal_session(true)?;
        {
            let _guard = self.sync_lock.lock();
            sync::run(self, false)?;
        }

        let blob = self.free_list.marshal();
        let freelist_off = self.data.current_size();
        self.data.write_at(&blob, freelist_off)?;
        self.write_header(Some((freelist_off, blob.len() as u32)))?;
        self.index.sync()?;
        self.data.sync()?;
        self.time_window.file().sync()?;
        self.wal.close()?;
        debug!("store closed");
        Ok(())
    }
}

fn spawn_worker(
    inner: Arc<DbInner>,
    close_rx: Receiver<()>,
    interval: std::time::Duration,
    work: fn(&DbInner),
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let ticker = tick(interval);
        loop {
            select! {
                recv(close_rx) -> _ => break,
                recv(ticker) -> _ => work(&inner),
            }
        }
    })
}
