//! Error and Result types for store operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid magic bytes in a file header.
    #[error("Invalid magic bytes: expected WRRN, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Record checksum does not match the stored value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Topic could not be parsed.
    #[error("Bad topic: {0}")]
    BadTopic(String),

    /// The trie has no window offset for a topic hash.
    #[error("Missing window offset for topic hash {0}")]
    MissingOffset(u64),

    /// A window block belongs to a different topic hash than expected.
    #[error("Window block validation failed: block topic hash {block}, expected {expected}")]
    WindowValidation {
        /// Topic hash stored in the block.
        block: u64,
        /// Topic hash the caller expected.
        expected: u64,
    },

    /// A log record or stored entry could not be decoded.
    #[error("Corrupted record: {0}")]
    Corrupted(String),

    /// The write-ahead log rejected an operation.
    #[error("Log error: {0}")]
    Log(String),

    /// Operation requires the `mutable` option.
    #[error("Store is not mutable")]
    Immutable,

    /// The store has been closed.
    #[error("Store is closed")]
    Closed,

    /// Entry is missing a field required by the operation.
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
