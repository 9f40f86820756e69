// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::bitvec::BitVec;
use crate::config::{Config, LSLOT_INDEX_BITS};
use xxhash_rust::xxh3::xxh3_128;

/// Number of bits in a fingerprint.
pub const FINGERPRINT_BITS: usize = 128;

/// A 128-bit hash of a key.
///
/// Logical layout from the LSB: segment-index bits (variable, grows with
/// the directory), a 6-bit block index, a 6-bit l-slot index, and the
/// remaining bits used inside the tenancy trie. The boundary between the
/// selection fields and the trie bits is the `fp_index`.
///
/// Fingerprint equality up to the used prefix does not imply key equality;
/// the log record is re-checked on reads.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Fingerprint {
    bits: BitVec<2>,
}

impl Fingerprint {
    /// Hashes a key into a fingerprint.
    #[must_use]
    pub fn from_key<C: Config>(key: u64) -> Self {
        if C::USE_XXHASH {
            let hash = xxh3_128(&key.to_le_bytes());
            Self {
                bits: BitVec::from_words([hash as u64, (hash >> 64) as u64]),
            }
        } else {
            // Deterministic fingerprints for tests: the key bits, repeated.
            Self {
                bits: BitVec::from_words([key, key]),
            }
        }
    }

    #[must_use]
    pub const fn from_words(lo: u64, hi: u64) -> Self {
        Self {
            bits: BitVec::from_words([lo, hi]),
        }
    }

    /// Parses a bit string where character `i` is the bit at index `i`.
    #[must_use]
    pub fn from_bit_str(s: &str) -> Self {
        debug_assert!(s.len() <= FINGERPRINT_BITS);
        Self {
            bits: BitVec::from_bit_str(s),
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index)
    }

    #[inline]
    #[must_use]
    pub const fn word(&self, idx: usize) -> u64 {
        self.bits.word(idx)
    }

    /// Directory index: bits `[0, depth)`.
    #[inline]
    #[must_use]
    pub fn segment_bits(&self, depth: usize) -> usize {
        self.bits.range_in_word(0, 0, depth) as usize
    }

    /// Block index within the segment: bits `[fp_index - 12, fp_index - 6)`.
    #[inline]
    #[must_use]
    pub fn block_bits(&self, fp_index: usize) -> usize {
        self.bits
            .range_in_word(0, fp_index - 2 * LSLOT_INDEX_BITS, fp_index - LSLOT_INDEX_BITS)
            as usize
    }

    /// L-slot index within the block: bits `[fp_index - 6, fp_index)`.
    #[inline]
    #[must_use]
    pub fn lslot_bits(&self, fp_index: usize) -> usize {
        self.bits.range_in_word(0, fp_index - LSLOT_INDEX_BITS, fp_index) as usize
    }

    /// Word-0 bits from `fp_index` upward, LSB-first.
    #[inline]
    #[must_use]
    pub fn suffix_from(&self, fp_index: usize) -> u64 {
        self.bits.range_in_word(0, fp_index, 64)
    }

    /// Rewrites the l-slot index field.
    ///
    /// Extension blocks address displaced l-slots by their physical index,
    /// so operations on them run against a fingerprint with this field
    /// replaced.
    pub fn set_lslot_bits(&mut self, new_index: usize, fp_index: usize) {
        self.bits.set_range_in_word(
            0,
            fp_index - LSLOT_INDEX_BITS,
            fp_index,
            new_index as u64,
        );
    }

    /// Index of the lowest differing bit of two fingerprints.
    ///
    /// Only the first word is considered; the trie never grows past it.
    #[inline]
    #[must_use]
    pub fn first_diff_index(&self, other: &Self) -> usize {
        (self.word(0) ^ other.word(0)).trailing_zeros() as usize
    }

    /// Whether both fingerprints agree on all bits at and above `fp_index`.
    ///
    /// The low bits are not compared: extension blocks rewrite the l-slot
    /// field.
    #[inline]
    #[must_use]
    pub fn matches_suffix(&self, other: &Self, fp_index: usize) -> bool {
        self.suffix_from(fp_index) == other.suffix_from(fp_index) && self.word(1) == other.word(1)
    }
}
