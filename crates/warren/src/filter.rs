//! Bloom filter over message sequence numbers.
//!
//! The expirer consults the filter before touching the index file, so
//! expiry passes skip disk reads for sequence numbers that were never
//! synced in this process.

/// Number of hash functions.
const HASH_COUNT: u8 = 3;

/// Bloom filter keyed by sequence number.
///
/// Uses xxhash64 with k=3 seeded hash functions:
/// `h_i(x) = xxhash64(x, seed=i) % size_bits`, roughly 10 bits per expected
/// item for a ~1% false positive rate.
#[derive(Debug)]
pub struct SeqFilter {
    bits: Vec<u64>,
}

impl SeqFilter {
    /// Creates a filter sized for the expected number of sequence numbers.
    pub fn new(expected_items: usize) -> Self {
        let num_bits = (expected_items * 10).max(64);
        let num_words = num_bits.div_ceil(64);
        Self {
            bits: vec![0u64; num_words],
        }
    }

    /// Adds a sequence number to the filter.
    pub fn insert(&mut self, seq: u64) {
        let num_bits = (self.bits.len() * 64) as u64;
        let key = seq.to_le_bytes();
        for seed in 0..HASH_COUNT {
            let bit_idx = xxhash_rust::xxh64::xxh64(&key, seed as u64) % num_bits;
            self.bits[(bit_idx / 64) as usize] |= 1u64 << (bit_idx % 64);
        }
    }

    /// Returns `true` if `seq` might have been inserted; `false` means it
    /// definitely was not.
    pub fn maybe_contains(&self, seq: u64) -> bool {
        let num_bits = (self.bits.len() * 64) as u64;
        let key = seq.to_le_bytes();
        for seed in 0..HASH_COUNT {
            let bit_idx = xxhash_rust::xxh64::xxh64(&key, seed as u64) % num_bits;
            if self.bits[(bit_idx / 64) as usize] & (1u64 << (bit_idx % 64)) == 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_query() {
        let mut f = SeqFilter::new(1000);
        for seq in 1..=500u64 {
            f.insert(seq);
        }
        for seq in 1..=500u64 {
            assert!(f.maybe_contains(seq));
        }
    }

    #[test]
    fn test_absent_mostly_rejected() {
        let mut f = SeqFilter::new(10_000);
        for seq in 1..=5_000u64 {
            f.insert(seq);
        }
        let false_positives = (1_000_000..1_010_000u64)
            .filter(|&seq| f.maybe_contains(seq))
            .count();
        // ~1% expected; allow generous slack.
        assert!(false_positives < 500, "false positives: {false_positives}");
    }
}
