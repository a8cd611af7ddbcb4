//! Crash recovery: replay unapplied log segments into the block cache and
//! time-window bucket, then run a recovery-flagged sync round.

use super::{sync, DbInner};
use crate::entry::RawEntry;
use crate::error::Result;
use crate::index::start_block_index;
use crate::message::Topic;
use crate::window::WinEntry;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Rebuilds in-memory state from the log and syncs it. Only after this
/// completes may the store accept new writes.
pub(crate) fn start_recovery(db: &DbInner) -> Result<()> {
    db.cache.clear();
    db.time_window.clear_pending();

    let time_ids = db.wal.scan();
    info!(segments = time_ids.len(), "replaying write-ahead log");

    let mut replayed = 0u64;
    let mut max_seq = 0u64;
    for time_id in time_ids {
        let records = db.wal.read(time_id)?;
        let time_mark = db.time_window.time_mark();
        time_mark.add(time_id);
        for raw in records {
            let (slot, topic_hash, contract, topic_bytes) = match RawEntry::decode(&raw) {
                Ok(p) => (p.slot, p.topic_hash, p.contract(), p.topic().to_vec()),
                Err(e) => {
                    warn!("skipping corrupt log record: {e}");
                    db.meter.entries_invalid.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            // The trie may not know this topic in a fresh process.
            match Topic::parse(&topic_bytes, contract) {
                Ok(topic) => {
                    db.trie
                        .add_topic(contract, topic.hash, &topic.parts, topic.depth);
                }
                Err(e) => {
                    warn!("log record names unparsable topic: {e}");
                }
            }
            db.time_window.add(
                time_id,
                topic_hash,
                WinEntry {
                    seq: slot.seq,
                    expires_at: slot.expires_at,
                },
            );
            db.cache
                .set(start_block_index(slot.seq) as u64, db.info.cache_id ^ slot.seq, raw);
            if slot.seq > max_seq {
                max_seq = slot.seq;
            }
            replayed += 1;
        }
        time_mark.release(time_id);
        time_mark.release_now(time_id);
    }
    db.info.seq.fetch_max(max_seq, Ordering::AcqRel);

    info!(entries = replayed, "log replay complete, running recovery sync");
    sync::run(db, true)
}
