//! Warren - embedded append-optimized pub/sub message store.
//!
//! Producers publish payloads tagged with hierarchical, wildcard-capable
//! topics and optional TTLs; consumers query by topic pattern with a time
//! window and a limit. Messages are durable, crash-recoverable and indexed
//! so the most recent entries for a topic are found without scanning all
//! data.
//!
//! # Components
//!
//! - [`Db`]: open/put/get/delete surface over four files
//!   (`<name>.idx`, `<name>.data`, `<name>.win`, `<name>.log`)
//! - [`wal::Wal`]: crash-recoverable write-ahead log
//! - [`window::TimeWindowBucket`]: pending writes grouped by time ID and
//!   the persisted per-topic window chains
//! - [`trie::TopicTrie`]: wildcard-capable topic matching with per-topic
//!   window tail offsets
//!
//! # Example
//!
//! ```rust,ignore
//! use warren::{Db, Options, Query};
//!
//! let db = Db::open("example", Options::default().with_dir("/tmp/warren"))?;
//!
//! db.put("teams.alpha.ch1", "msg for team alpha channel1")?;
//! db.put("teams.alpha.ch1.*", "msg for all receivers of channel1")?;
//! db.put("teams.alpha...", "msg for all channels of team alpha")?;
//! db.sync()?;
//!
//! for msg in db.get(Query::new("teams.alpha.ch1?last=1h").with_limit(10))? {
//!     println!("{}", String::from_utf8_lossy(&msg));
//! }
//! db.close()?;
//! ```

#![deny(missing_docs)]

mod db;

pub mod data;
pub mod entry;
pub mod error;
pub mod filter;
pub mod fio;
pub mod freelist;
pub mod hash;
pub mod index;
pub mod mem;
pub mod message;
pub mod options;
pub mod timemark;
pub mod trie;
pub mod wal;
pub mod window;

pub use db::{Db, Stats};
pub use error::{Result, StoreError};
pub use message::{Contract, Entry, MessageId, Query, DEFAULT_CONTRACT};
pub use options::Options;
