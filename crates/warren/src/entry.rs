//! Entry records shared by the block cache, the WAL and the index file.
//!
//! A raw entry, as held in the block cache and replayed from the log, is a
//! fixed header followed by the message bytes that land in the data file:
//!
//! ```text
//! ┌──────────────────────────────┬───────────┬──────────┬───────┬───────┐
//! │ Slot header (26 bytes)       │ topicHash │ contract │ topic │ value │
//! │ seq | topicSize | valueSize  │ (8 bytes) │ (8 bytes)│       │       │
//! │ expiresAt | msgOffset        │           │          │       │       │
//! └──────────────────────────────┴───────────┴──────────┴───────┴───────┘
//! ```
//!
//! The slot header alone is what the index file persists; `msgOffset` stays
//! zero until the sync round appends the message bytes to the data file.
//! The contract travels with the message so the topic trie can be rebuilt
//! from disk on open.

use crate::error::{Result, StoreError};
use crate::message::Contract;

/// Size of a slot record in the index file.
pub const SLOT_SIZE: usize = 26;

/// Size of the full raw-entry header (slot + topic hash).
pub const ENTRY_HEADER_SIZE: usize = SLOT_SIZE + 8;

/// Fixed-size index record for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
    /// Sequence number of the message.
    pub seq: u64,
    /// Length of the topic path stored with the message.
    pub topic_size: u16,
    /// Length of the message payload.
    pub value_size: u32,
    /// Expiry as unix seconds; zero means no TTL.
    pub expires_at: u32,
    /// Offset of the message bytes in the data file.
    pub msg_offset: i64,
}

impl Slot {
    /// Total size of the message bytes in the data file
    /// (contract prefix + topic + value).
    pub fn message_size(&self) -> u32 {
        8 + self.topic_size as u32 + self.value_size
    }

    /// Returns `true` if the record has expired at `now` (unix seconds).
    pub fn is_expired(&self, now: u32) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }

    /// Serializes the slot into `buf`, which must hold [`SLOT_SIZE`] bytes.
    pub fn marshal(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..10].copy_from_slice(&self.topic_size.to_le_bytes());
        buf[10..14].copy_from_slice(&self.value_size.to_le_bytes());
        buf[14..18].copy_from_slice(&self.expires_at.to_le_bytes());
        buf[18..26].copy_from_slice(&self.msg_offset.to_le_bytes());
    }

    /// Deserializes a slot from the first [`SLOT_SIZE`] bytes of `buf`.
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < SLOT_SIZE {
            return Err(StoreError::Corrupted("slot record too short".into()));
        }
        Ok(Self {
            seq: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            topic_size: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
            value_size: u32::from_le_bytes(buf[10..14].try_into().unwrap()),
            expires_at: u32::from_le_bytes(buf[14..18].try_into().unwrap()),
            msg_offset: i64::from_le_bytes(buf[18..26].try_into().unwrap()),
        })
    }
}

/// Encodes a raw entry for the block cache and the WAL.
pub fn encode_raw(
    seq: u64,
    expires_at: u32,
    topic_hash: u64,
    contract: Contract,
    topic: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let slot = Slot {
        seq,
        topic_size: topic.len() as u16,
        value_size: value.len() as u32,
        expires_at,
        msg_offset: 0,
    };
    let mut raw = vec![0u8; ENTRY_HEADER_SIZE + 8 + topic.len() + value.len()];
    slot.marshal(&mut raw[..SLOT_SIZE]);
    raw[SLOT_SIZE..ENTRY_HEADER_SIZE].copy_from_slice(&topic_hash.to_le_bytes());
    let body = &mut raw[ENTRY_HEADER_SIZE..];
    body[..8].copy_from_slice(&contract.to_le_bytes());
    body[8..8 + topic.len()].copy_from_slice(topic);
    body[8 + topic.len()..].copy_from_slice(value);
    raw
}

/// A raw entry split into its header and message bytes.
#[derive(Debug)]
pub struct RawEntry<'a> {
    /// Decoded slot header (`msg_offset` still zero).
    pub slot: Slot,
    /// Hash of the topic the entry was published to.
    pub topic_hash: u64,
    /// Message bytes destined for the data file: contract + topic + value.
    pub message: &'a [u8],
}

impl<'a> RawEntry<'a> {
    /// Decodes a raw entry, validating the advertised lengths.
    pub fn decode(raw: &'a [u8]) -> Result<Self> {
        let slot = Slot::unmarshal(raw)?;
        if raw.len() < ENTRY_HEADER_SIZE {
            return Err(StoreError::Corrupted("entry header too short".into()));
        }
        let topic_hash = u64::from_le_bytes(raw[SLOT_SIZE..ENTRY_HEADER_SIZE].try_into().unwrap());
        let message = &raw[ENTRY_HEADER_SIZE..];
        if message.len() != slot.message_size() as usize {
            return Err(StoreError::Corrupted(format!(
                "entry length mismatch: header says {}, have {}",
                slot.message_size(),
                message.len()
            )));
        }
        Ok(Self {
            slot,
            topic_hash,
            message,
        })
    }

    /// Contract the entry was published under.
    pub fn contract(&self) -> Contract {
        u64::from_le_bytes(self.message[..8].try_into().unwrap())
    }

    /// Topic path stored with the message.
    pub fn topic(&self) -> &'a [u8] {
        &self.message[8..8 + self.slot.topic_size as usize]
    }

    /// Message payload.
    pub fn value(&self) -> &'a [u8] {
        &self.message[8 + self.slot.topic_size as usize..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_roundtrip() {
        let slot = Slot {
            seq: 42,
            topic_size: 7,
            value_size: 100,
            expires_at: 12345,
            msg_offset: 4096,
        };
        let mut buf = [0u8; SLOT_SIZE];
        slot.marshal(&mut buf);
        assert_eq!(Slot::unmarshal(&buf).unwrap(), slot);
    }

    #[test]
    fn test_raw_entry_roundtrip() {
        let raw = encode_raw(9, 0, 0xfeed, 77, b"teams.alpha", b"payload");
        let e = RawEntry::decode(&raw).unwrap();
        assert_eq!(e.slot.seq, 9);
        assert_eq!(e.topic_hash, 0xfeed);
        assert_eq!(e.contract(), 77);
        assert_eq!(e.topic(), b"teams.alpha");
        assert_eq!(e.value(), b"payload");
        assert_eq!(e.slot.message_size() as usize, e.message.len());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let mut raw = encode_raw(9, 0, 1, 77, b"t", b"v");
        raw.truncate(raw.len() - 1);
        assert!(RawEntry::decode(&raw).is_err());
        assert!(Slot::unmarshal(&raw[..10]).is_err());
    }

    #[test]
    fn test_slot_expiry() {
        let slot = Slot {
            expires_at: 100,
            ..Default::default()
        };
        assert!(!slot.is_expired(99));
        assert!(slot.is_expired(100));
        let no_ttl = Slot::default();
        assert!(!no_ttl.is_expired(u32::MAX));
    }
}
