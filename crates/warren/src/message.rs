//! Topics, contracts, message IDs and the public entry/query builders.
//!
//! A topic is a dot-separated path of levels. `*` matches exactly one level
//! and `...` (trailing) matches any suffix up to [`TOPIC_MAX_DEPTH`] levels.
//! A query-string fragment after `?` carries per-operation options:
//! `last=<duration>`, `ttl=<duration>`, `limit=<int>`.

use crate::error::{Result, StoreError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum number of levels in a topic.
pub const TOPIC_MAX_DEPTH: usize = 16;

/// 64-bit namespace isolating sets of topics from each other.
pub type Contract = u64;

/// Contract applied when the caller does not supply one.
pub const DEFAULT_CONTRACT: Contract = 0x6d61_7374_6572_6321;

/// Part kind markers carried in [`Part::wildchars`].
pub const PART_LITERAL: u8 = 0;
/// Single-level wildcard (`*`).
pub const PART_SINGLE: u8 = 1;
/// Multi-level wildcard (`...`).
pub const PART_MULTI: u8 = 2;

/// One level of a parsed topic.
///
/// `query` is the 32-bit hash of the level under its contract;
/// `wildchars` marks the wildcard kind of the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Part {
    /// Hash of the literal level, seeded by the contract.
    pub query: u32,
    /// Wildcard marker: [`PART_LITERAL`], [`PART_SINGLE`] or [`PART_MULTI`].
    pub wildchars: u8,
}

impl Part {
    /// Returns `true` for the single-level wildcard.
    pub fn is_single(&self) -> bool {
        self.wildchars == PART_SINGLE
    }

    /// Returns `true` for the multi-level wildcard.
    pub fn is_multi(&self) -> bool {
        self.wildchars == PART_MULTI
    }
}

/// A parsed topic with its per-operation options.
#[derive(Debug, Clone)]
pub struct Topic {
    /// Parsed levels, root first.
    pub parts: Vec<Part>,
    /// Number of levels.
    pub depth: u8,
    /// Topic path without the options fragment, wildcards included.
    pub path: Vec<u8>,
    /// Hash of the path, seeded by the contract.
    pub hash: u64,
    /// `last=` option: how far back in time a query reaches.
    pub last: Option<Duration>,
    /// `ttl=` option: time to live for a published message.
    pub ttl: Option<Duration>,
    /// `limit=` option: result cap for a query.
    pub limit: Option<usize>,
}

impl Topic {
    /// Parses `raw` under the given contract.
    pub fn parse(raw: &[u8], contract: Contract) -> Result<Self> {
        let raw = std::str::from_utf8(raw)
            .map_err(|_| StoreError::BadTopic("topic is not valid utf-8".into()))?;
        let (path, options) = match raw.split_once('?') {
            Some((p, o)) => (p, Some(o)),
            None => (raw, None),
        };
        if path.is_empty() {
            return Err(StoreError::BadTopic("empty topic".into()));
        }

        let (path, multi) = match path.strip_suffix("...") {
            Some(head) => {
                let head = head.strip_suffix('.').unwrap_or(head);
                if head.is_empty() {
                    return Err(StoreError::BadTopic("topic has no literal levels".into()));
                }
                (head, true)
            }
            None => (path, false),
        };

        let mut parts = Vec::new();
        for level in path.split('.') {
            match level {
                "" => {
                    return Err(StoreError::BadTopic(format!("empty level in `{raw}`")));
                }
                // Wildcard levels are hashed under the contract as well, so
                // wildcard trie edges never collide across namespaces.
                "*" => parts.push(Part {
                    query: part_hash(contract, b"*"),
                    wildchars: PART_SINGLE,
                }),
                _ => parts.push(Part {
                    query: part_hash(contract, level.as_bytes()),
                    wildchars: PART_LITERAL,
                }),
            }
        }
        if multi {
            parts.push(Part {
                query: part_hash(contract, b"..."),
                wildchars: PART_MULTI,
            });
        }
        if parts.len() > TOPIC_MAX_DEPTH {
            return Err(StoreError::BadTopic(format!(
                "topic exceeds {TOPIC_MAX_DEPTH} levels"
            )));
        }

        let full_path: &str = if multi { raw } else { path };
        // Hash covers the wildcard characters so `a.b`, `a.b.*` and `a.b...`
        // are distinct topic identities.
        let mut topic = Self {
            depth: parts.len() as u8,
            parts,
            path: full_path
                .split('?')
                .next()
                .unwrap_or(full_path)
                .as_bytes()
                .to_vec(),
            hash: 0,
            last: None,
            ttl: None,
            limit: None,
        };
        topic.hash = topic_hash(contract, &topic.path);

        if let Some(options) = options {
            for opt in options.split('&') {
                let Some((key, value)) = opt.split_once('=') else {
                    continue;
                };
                match key {
                    "last" => {
                        topic.last = Some(parse_duration(value).ok_or_else(|| {
                            StoreError::BadTopic(format!("bad last duration `{value}`"))
                        })?);
                    }
                    "ttl" => {
                        topic.ttl = Some(parse_duration(value).ok_or_else(|| {
                            StoreError::BadTopic(format!("bad ttl duration `{value}`"))
                        })?);
                    }
                    "limit" => {
                        topic.limit = Some(value.parse().map_err(|_| {
                            StoreError::BadTopic(format!("bad limit `{value}`"))
                        })?);
                    }
                    _ => {
                        return Err(StoreError::BadTopic(format!("unknown option `{key}`")));
                    }
                }
            }
        }

        Ok(topic)
    }

    /// Returns `true` if any level is a wildcard.
    pub fn has_wildcards(&self) -> bool {
        self.parts.iter().any(|p| p.wildchars != PART_LITERAL)
    }
}

/// Hashes a topic path under a contract.
pub fn topic_hash(contract: Contract, path: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(path, contract)
}

/// Hashes a single literal level under a contract.
pub fn part_hash(contract: Contract, level: &[u8]) -> u32 {
    xxhash_rust::xxh64::xxh64(level, contract) as u32
}

/// Unique identifier of an accepted message.
///
/// The ID embeds the sequence number it was minted with, so deletes can
/// resolve the target slot without a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 12]);

impl MessageId {
    /// Builds an ID from the store salt and a sequence number.
    pub fn new(salt: u32, seq: u64) -> Self {
        let mut raw = [0u8; 12];
        raw[..4].copy_from_slice(&salt.to_le_bytes());
        raw[4..].copy_from_slice(&seq.to_le_bytes());
        Self(raw)
    }

    /// Returns the embedded sequence number.
    pub fn seq(&self) -> u64 {
        u64::from_le_bytes(self.0[4..].try_into().unwrap())
    }

    /// Returns the raw bytes of the ID.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// A message to publish via `put_entry`.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Destination topic, optionally with a `?ttl=` fragment.
    pub topic: Vec<u8>,
    /// Message payload.
    pub payload: Vec<u8>,
    /// Explicit message ID; assigned by the store when absent.
    pub id: Option<MessageId>,
    /// Contract namespace; [`DEFAULT_CONTRACT`] when absent.
    pub contract: Option<Contract>,
    /// Time to live; overrides a `?ttl=` topic option.
    pub ttl: Option<Duration>,
}

impl Entry {
    /// Creates an entry for `topic` carrying `payload`.
    pub fn new(topic: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            id: None,
            contract: None,
            ttl: None,
        }
    }

    /// Sets an explicit message ID.
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the contract namespace.
    pub fn with_contract(mut self, contract: Contract) -> Self {
        self.contract = Some(contract);
        self
    }

    /// Sets the time to live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A topic query built for `get`.
#[derive(Debug, Clone)]
pub struct Query {
    /// Topic pattern, optionally with `?last=`/`?limit=` options.
    pub topic: Vec<u8>,
    /// Contract namespace; [`DEFAULT_CONTRACT`] when absent.
    pub contract: Option<Contract>,
    /// Result cap; overrides a `?limit=` topic option.
    pub limit: Option<usize>,
}

impl Query {
    /// Creates a query for `topic`.
    pub fn new(topic: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            contract: None,
            limit: None,
        }
    }

    /// Sets the contract namespace.
    pub fn with_contract(mut self, contract: Contract) -> Self {
        self.contract = Some(contract);
        self
    }

    /// Sets the result cap.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Current wall clock as unix seconds.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Parses durations of the form `500ms`, `90s`, `30m`, `1h`, `7d`.
/// A bare integer is treated as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        "d" => Some(Duration::from_secs(value * 86400)),
        _ => None,
    }
}
