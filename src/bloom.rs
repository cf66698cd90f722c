//! Bloom filter over entry ids
//!
//! Bit positions come from a SHA-256 chain: the first digest is taken
//! over the big-endian id, each following one over the previous fold.
//! Used as an admission pre-check in front of the file cache, never as a
//! source of truth.

use crate::entry::EntryId;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    bit_len: usize,
    depth: usize,
}

impl BloomFilter {
    /// Create a filter with `bit_len` bits and `depth` chained hash positions
    pub fn new(bit_len: usize, depth: usize) -> Self {
        let bit_len = bit_len.max(2);
        BloomFilter {
            bits: vec![0u64; (bit_len + 63) / 64],
            bit_len,
            depth: depth.max(1),
        }
    }

    fn fold(value: u32) -> u32 {
        let digest = Sha256::digest(value.to_be_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7FFF_FFFF
    }

    fn positions(&self, id: EntryId) -> impl Iterator<Item = usize> + '_ {
        let modulus = (self.bit_len - 1) as u32;
        let mut hash = id as u32;
        (0..self.depth).map(move |_| {
            hash = Self::fold(hash);
            (hash % modulus) as usize
        })
    }

    pub fn add(&mut self, id: EntryId) {
        let positions: Vec<usize> = self.positions(id).collect();
        for pos in positions {
            self.bits[pos / 64] |= 1u64 << (pos % 64);
        }
    }

    /// May return true for ids never added; never false for added ones
    pub fn contains(&self, id: EntryId) -> bool {
        self.positions(id)
            .all(|pos| self.bits[pos / 64] & (1u64 << (pos % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_added_is_contained() {
        let mut filter = BloomFilter::new(1024, 3);
        for id in [0, 1, -1, 42, i32::MAX, i32::MIN] {
            filter.add(id);
            assert!(filter.contains(id));
        }
    }

    #[test]
    fn test_empty_contains_nothing() {
        let filter = BloomFilter::new(1024, 3);
        assert!((0..100).all(|id| !filter.contains(id)));
    }

    #[test]
    fn test_clear() {
        let mut filter = BloomFilter::new(256, 2);
        filter.add(7);
        filter.clear();
        assert!(!filter.contains(7));
    }

    #[test]
    fn test_false_positive_rate_is_low() {
        let mut filter = BloomFilter::new(65_536, 3);
        for id in 0..1000 {
            filter.add(id);
        }
        let false_positives = (100_000..110_000).filter(|&id| filter.contains(id)).count();
        // ~0.0005 expected with 1000 items in 64 Kibit, allow generous slack
        assert!(false_positives < 100, "{} false positives", false_positives);
    }
}
