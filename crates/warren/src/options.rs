//! Store configuration.

use crate::wal::WalOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables accepted by [`crate::Db::open`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the store files.
    pub dir: PathBuf,
    /// Allows `delete_entry`.
    pub mutable: bool,
    /// Block-cache size that forces a sync when exceeded.
    pub mem_size: u64,
    /// Age a sealed log segment must reach before the background sync
    /// picks it up.
    pub log_release_duration: Duration,
    /// Background sync cadence.
    pub sync_interval: Duration,
    /// Base tick of the background expirer.
    pub exp_duration: Duration,
    /// Multiplier on the expirer tick.
    pub max_exp_durations: usize,
    /// Result cap applied when a query names none.
    pub default_query_limit: usize,
    /// Hard cap on query results.
    pub max_query_limit: usize,
    /// Capacity of each topic's recent-entry ring in the trie.
    pub ring_cap: usize,
    /// Expected number of live messages, used to size the seq filter.
    pub filter_capacity: usize,
    /// Write-ahead log options.
    pub wal: WalOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            mutable: false,
            mem_size: 64 << 20,
            log_release_duration: Duration::from_secs(1),
            sync_interval: Duration::from_secs(1),
            exp_duration: Duration::from_secs(60),
            max_exp_durations: 1,
            default_query_limit: 100,
            max_query_limit: 1000,
            ring_cap: 128,
            filter_capacity: 1 << 20,
            wal: WalOptions::default(),
        }
    }
}

impl Options {
    /// Sets the store directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Enables `delete_entry`.
    pub fn with_mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    /// Sets the block-cache backpressure threshold.
    pub fn with_mem_size(mut self, bytes: u64) -> Self {
        self.mem_size = bytes;
        self
    }

    /// Sets the log release duration.
    pub fn with_log_release_duration(mut self, d: Duration) -> Self {
        self.log_release_duration = d;
        self
    }

    /// Sets the background sync cadence.
    pub fn with_sync_interval(mut self, d: Duration) -> Self {
        self.sync_interval = d;
        self
    }
}
