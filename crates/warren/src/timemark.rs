//! Release tracking for time IDs.
//!
//! Every write belongs to a time ID (one per WAL segment). A time ID is
//! eligible for sync only once it is released: its reference count has
//! dropped to zero and the last unref is older than the release duration.
//! Aborted time IDs (refs = -1) are unwound by the time-window bucket
//! instead of synced.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TimeRecord {
    refs: i32,
    last_unref: Instant,
    released: bool,
    aborted: bool,
}

impl TimeRecord {
    fn new() -> Self {
        Self {
            refs: 0,
            last_unref: Instant::now(),
            released: false,
            aborted: false,
        }
    }
}

/// Tracks per-time-ID reference counts and release state.
#[derive(Debug, Default)]
pub struct TimeMark {
    records: Mutex<HashMap<i64, TimeRecord>>,
}

impl TimeMark {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a reference on `time_id`.
    pub fn add(&self, time_id: i64) {
        let mut records = self.records.lock();
        records.entry(time_id).or_insert_with(TimeRecord::new).refs += 1;
    }

    /// Drops a reference on `time_id` and stamps the unref time.
    pub fn release(&self, time_id: i64) {
        let mut records = self.records.lock();
        let rec = records.entry(time_id).or_insert_with(TimeRecord::new);
        if rec.refs > 0 {
            rec.refs -= 1;
        }
        rec.last_unref = Instant::now();
    }

    /// Marks a tracked `time_id` released immediately, bypassing the age
    /// check. Unknown time IDs are ignored (their entries were already
    /// drained).
    ///
    /// Used by the explicit sync path so durability is deterministic.
    pub fn release_now(&self, time_id: i64) {
        let mut records = self.records.lock();
        if let Some(rec) = records.get_mut(&time_id) {
            rec.refs = 0;
            rec.released = true;
        }
    }

    /// Marks `time_id` aborted; its pending entries are unwound, not synced.
    pub fn abort(&self, time_id: i64) {
        let mut records = self.records.lock();
        let rec = records.entry(time_id).or_insert_with(TimeRecord::new);
        rec.refs = -1;
        rec.aborted = true;
    }

    /// Returns `true` if `time_id` has been released.
    pub fn is_released(&self, time_id: i64) -> bool {
        self.records
            .lock()
            .get(&time_id)
            .map(|r| r.released)
            .unwrap_or(false)
    }

    /// Returns `true` if `time_id` has been aborted.
    pub fn is_aborted(&self, time_id: i64) -> bool {
        self.records
            .lock()
            .get(&time_id)
            .map(|r| r.aborted)
            .unwrap_or(false)
    }

    /// Time IDs currently marked aborted.
    pub fn aborted_ids(&self) -> Vec<i64> {
        self.records
            .lock()
            .iter()
            .filter(|(_, r)| r.refs == -1)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Releaser sweep: marks released every time ID whose refs reached zero
    /// and whose last unref is at least `max_duration` old.
    pub fn run_releaser(&self, max_duration: Duration) {
        let mut records = self.records.lock();
        for rec in records.values_mut() {
            if !rec.released
                && !rec.aborted
                && rec.refs == 0
                && rec.last_unref.elapsed() >= max_duration
            {
                rec.released = true;
            }
        }
    }

    /// Forgets `time_id` once its entries are durable (or unwound).
    pub fn remove(&self, time_id: i64) {
        self.records.lock().remove(&time_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_cycle() {
        let tm = TimeMark::new();
        tm.add(1);
        assert!(!tm.is_released(1));

        tm.release(1);
        // refs == 0 but not yet aged.
        tm.run_releaser(Duration::from_secs(60));
        assert!(!tm.is_released(1));

        tm.run_releaser(Duration::ZERO);
        assert!(tm.is_released(1));
    }

    #[test]
    fn test_release_now_bypasses_age() {
        let tm = TimeMark::new();
        tm.add(7);
        tm.release_now(7);
        assert!(tm.is_released(7));
    }

    #[test]
    fn test_pending_refs_block_release() {
        let tm = TimeMark::new();
        tm.add(3);
        tm.add(3);
        tm.release(3);
        tm.run_releaser(Duration::ZERO);
        assert!(!tm.is_released(3), "one reference still held");

        tm.release(3);
        tm.run_releaser(Duration::ZERO);
        assert!(tm.is_released(3));
    }

    #[test]
    fn test_abort() {
        let tm = TimeMark::new();
        tm.add(5);
        tm.abort(5);
        assert!(tm.is_aborted(5));
        assert_eq!(tm.aborted_ids(), vec![5]);

        tm.run_releaser(Duration::ZERO);
        assert!(!tm.is_released(5), "aborted time ids never release");

        tm.remove(5);
        assert!(!tm.is_aborted(5));
    }
}
