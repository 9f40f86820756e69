// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A block: 256 bits of metadata plus a payload slot list for 64 l-slots.
//!
//! Metadata layout over four 64-bit words:
//!
//! - word 0: occupancy bitmap, bit `i` set iff l-slot `i` has tenancy >= 1,
//! - words 1-2 (and into 3): per non-empty l-slot a unary tenancy run
//!   (`ten - 1` zeros, one 1), in l-slot order, followed by the
//!   concatenated trie encodings of l-slots with tenancy >= 2, in the same
//!   order; the transition between the two regions is implicit from
//!   occupancy rank,
//! - word 3 tail: a validity bit at position 255 while the block is whole;
//!   once l-slots have been displaced into extension blocks, bit 255 is
//!   clear and a marker bit at `191 + first_extended_lslot` encodes the
//!   boundary. Reads of l-slots at or above the boundary are redirected by
//!   the segment.
//!
//! Free space is measured inside word 3: the gap between the top marker
//! bit and the next set bit below it.

use crate::bitvec::BitVec;
use crate::coding::Record;
use crate::config::{payload_capacity, Config, ReadOffStrategy, LSLOT_COUNT};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::payload::PayloadList;
use crate::ssd_log::SsdLog;
use crate::trie::{TenancyTrie, TrieBits};

/// Tenancy of one l-slot plus the summed tenancies of the l-slots before it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TenancyInfo {
    pub before: usize,
    pub ten: usize,
}

/// Free-space snapshot of a block.
#[derive(Copy, Clone, Debug)]
pub struct BlockInfo {
    pub extended: bool,
    pub first_extended_lslot: usize,
    pub remaining_bits: usize,
    pub remaining_payload: usize,
}

/// Result of a block-level write; never surfaced to store callers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// The target l-slot lives in an extension block.
    LslotExtended,
    /// Not enough metadata bits; the segment displaces or splits.
    BlockFull,
    /// No payload slot left; the segment displaces or splits.
    PayloadFull,
}

/// Result of a block-level remove.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
    /// The target l-slot lives in an extension block.
    LslotExtended,
}

/// One block of a segment.
#[derive(Clone)]
pub struct Block<C: Config> {
    pub(crate) bits: BitVec<4>,
    pub(crate) payloads: PayloadList<C>,
}

impl<C: Config> Default for Block<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> Block<C> {
    #[must_use]
    pub fn new() -> Self {
        let mut bits = BitVec::new();
        bits.set(BitVec::<4>::BITS - 1, true); // validity bit
        Self {
            bits,
            payloads: PayloadList::new(),
        }
    }

    /// Last usable metadata bit (exclusive) given the extension boundary.
    #[must_use]
    pub(crate) fn last_available(first_extended_lslot: usize) -> usize {
        3 * 64 + first_extended_lslot - 1
    }

    #[must_use]
    pub fn block_info(&self) -> BlockInfo {
        let extended = !self.bits.get(BitVec::<4>::BITS - 1);
        let leading = self.bits.leading_zeros_in_word(3);
        let first_extended_lslot = if extended {
            debug_assert!(LSLOT_COUNT > leading);
            LSLOT_COUNT - leading
        } else {
            LSLOT_COUNT
        };
        let remaining_bits = self
            .bits
            .second_leading_zeros_in_word(3)
            .saturating_sub(leading + 1);

        BlockInfo {
            extended,
            first_extended_lslot,
            remaining_bits,
            remaining_payload: payload_capacity::<C>() - self.payloads.occupied(),
        }
    }

    /// Tenancy of an l-slot.
    #[must_use]
    pub fn tenancy(&self, lslot: usize) -> usize {
        if !self.bits.get(lslot) {
            return 0;
        }
        let rank = self.bits.rank(lslot);
        let prev_end = if rank > 0 {
            self.bits.select_from(rank, 1) as i64
        } else {
            -1
        };
        let ten_end = self.bits.select_from(rank + 1, 1) as i64;
        (ten_end - prev_end) as usize
    }

    /// Tenancy of an l-slot plus the tenancy sum of the l-slots before it.
    #[must_use]
    pub fn tenancy_info(&self, lslot: usize) -> TenancyInfo {
        let rank = self.bits.rank(lslot);
        if rank == 0 {
            let ten = if self.bits.get(lslot) {
                self.bits.select_from(1, 1) + 1
            } else {
                0
            };
            return TenancyInfo { before: 0, ten };
        }
        if self.bits.get(lslot) {
            let (first, second) = self.bits.select_two(rank, rank + 1, 1);
            TenancyInfo {
                before: first + 1,
                ten: second - first,
            }
        } else {
            TenancyInfo {
                before: self.bits.select_from(rank, 1) + 1,
                ten: 0,
            }
        }
    }

    /// Rewrites an l-slot's tenancy run in place, shifting the area after
    /// it. `to` bounds the shift (exclusive).
    pub fn set_tenancy(&mut self, lslot: usize, new_ten: usize, to: usize) {
        let info = self.tenancy_info(lslot);
        if info.ten == new_ten {
            return;
        }
        self.bits.set(lslot, new_ten != 0);
        let steps = new_ten as i64 - info.ten as i64;
        let from = 64 + info.before;
        self.bits.shift(steps, from, to);
        if info.ten == 0 {
            self.bits.set(from + new_ten - 1, true);
        }
    }

    /// First payload index of an l-slot (the tenancy sum before it).
    #[must_use]
    pub fn payload_start(&self, lslot: usize) -> usize {
        let rank = self.bits.rank(lslot);
        if rank == 0 {
            0
        } else {
            self.bits.select_from(rank, 1) + 1
        }
    }

    /// First bit of an l-slot's trie encoding.
    #[must_use]
    pub fn lslot_start(&self, lslot: usize) -> usize {
        let rank = self.bits.rank(lslot);
        let prev_end = if rank > 0 {
            self.bits.select_from(rank, 1) as i64
        } else {
            -1
        };
        let ones_before = (self.bits.rank(64) << 1)
            + (((prev_end + 1) as usize - rank) << 1);
        if ones_before > 0 {
            self.bits.select(ones_before) + 1
        } else {
            0
        }
    }

    /// Bit range `[start, end)` of an l-slot's trie encoding.
    #[must_use]
    pub fn lslot_bit_range(&self, lslot: usize) -> (usize, usize) {
        (self.lslot_start(lslot), self.lslot_start(lslot + 1))
    }

    /// Number of non-empty l-slots.
    #[must_use]
    pub fn occupancy_count(&self) -> usize {
        self.bits.rank(64)
    }

    /// Tenancy sum over the home l-slots below the extension boundary.
    #[must_use]
    pub fn total_tenancy(&self, first_extended_lslot: usize) -> usize {
        (0..first_extended_lslot).map(|l| self.tenancy(l)).sum()
    }

    /// Resolves a fingerprint to `(payload_start, offset)` within its
    /// l-slot's payload run.
    #[must_use]
    pub fn locate(&self, fp: &Fingerprint, fp_index: usize) -> (usize, usize) {
        let lslot = fp.lslot_bits(fp_index);

        if !self.bits.get(lslot) {
            return (self.payload_start(lslot), 0);
        }

        let rank = self.bits.rank(lslot);
        let prev_end = if rank > 0 {
            self.bits.select_from(rank, 1) as i64
        } else {
            -1
        };
        let ten_end = self.bits.select_from(rank + 1, 1) as i64;
        let ten = (ten_end - prev_end) as usize;
        let payload_start = (prev_end + 1) as usize;

        if ten == 1 {
            return (payload_start, 0);
        }

        let ones_before = (self.bits.rank(64) << 1) + ((payload_start - rank) << 1);

        let ten2_fastpath = matches!(
            C::READ_OFF_STRATEGY,
            ReadOffStrategy::Optimised | ReadOffStrategy::NoHashtable
        );
        if ten == 2 && ten2_fastpath {
            // The whole encoding is a unary gap: one fingerprint bit
            // decides the offset.
            let (first, second) = self.bits.select_two(ones_before, ones_before + 1, 0);
            let gap = second - first - 1;
            let offset = usize::from(fp.get(fp_index + gap));
            return (payload_start, offset);
        }

        let start = self.bits.select(ones_before) + 1;
        let mut index = start;
        let mut ten_left = ten as i64;
        let mut total_ten = ten as i64;
        let offset = self.walk_offset(&mut index, -1, &mut ten_left, fp, fp_index, &mut total_ten);
        (payload_start, offset)
    }

    /// Skips one trie encoding, consuming leaves from the shared counter.
    fn walk_skip(&self, index: &mut usize, ten_left: &mut i64) {
        let (left_leaf, right_leaf) = if *ten_left != 2 {
            let l = self.bits.get(*index);
            let r = self.bits.get(*index + 1);
            *index += 2;
            (l, r)
        } else {
            (true, true)
        };
        *index += 1 + self.bits.zeros_until_one(*index);

        if left_leaf && right_leaf {
            *ten_left -= 2;
        } else if left_leaf != right_leaf {
            *ten_left -= 1;
            self.walk_skip(index, ten_left);
        } else {
            self.walk_skip(index, ten_left);
            self.walk_skip(index, ten_left);
        }
    }

    /// Streaming offset query over an encoded trie, no arena allocation.
    ///
    /// `depth` is relative to `fp_index`, starting at -1 above the root.
    fn walk_offset(
        &self,
        index: &mut usize,
        depth: i64,
        ten_left: &mut i64,
        fp: &Fingerprint,
        fp_index: usize,
        total_ten: &mut i64,
    ) -> usize {
        let (left_leaf, right_leaf) = if *ten_left != 2 {
            let l = self.bits.get(*index);
            let r = self.bits.get(*index + 1);
            *index += 2;
            (l, r)
        } else {
            (true, true)
        };
        let gap = 1 + self.bits.zeros_until_one(*index) as i64;
        *index += gap as usize;
        let depth = depth + gap;
        let is_right = fp.get((depth + fp_index as i64) as usize);

        match (left_leaf, right_leaf) {
            (true, true) => {
                if is_right {
                    (*total_ten - *ten_left + 1) as usize
                } else {
                    (*total_ten - *ten_left) as usize
                }
            }
            (false, true) => {
                *ten_left -= 1;
                *total_ten -= 1;
                if is_right {
                    self.walk_skip(index, ten_left);
                    (*total_ten - *ten_left) as usize
                } else {
                    self.walk_offset(index, depth, ten_left, fp, fp_index, total_ten)
                }
            }
            (true, false) => {
                if is_right {
                    *ten_left -= 1;
                    self.walk_offset(index, depth, ten_left, fp, fp_index, total_ten)
                } else {
                    (*total_ten - *ten_left) as usize
                }
            }
            (false, false) => {
                if is_right {
                    self.walk_skip(index, ten_left);
                    self.walk_offset(index, depth, ten_left, fp, fp_index, total_ten)
                } else {
                    self.walk_offset(index, depth, ten_left, fp, fp_index, total_ten)
                }
            }
        }
    }

    /// Looks up a fingerprint; `None` when it is provably absent or the
    /// log record disagrees.
    pub fn read(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        fp_index: usize,
    ) -> Result<Option<Record>> {
        if C::DHT_MODE {
            return self.read_dht(fp, log, fp_index);
        }

        let (payload_start, offset) = self.locate(fp, fp_index);
        let payload_index = payload_start + offset;
        if payload_index >= self.payloads.occupied() {
            return Ok(None);
        }

        if C::NUMBER_EXTRA_BITS > 1 {
            let (valid, extra) = self.payloads.reserve_bits_at(payload_index);
            let chunk = if valid == 0 {
                0
            } else {
                fp.suffix_from(fp_index) & ((1u64 << valid) - 1)
            };
            if chunk != extra {
                // Reserve-bit mismatch proves absence without a log read.
                return Ok(None);
            }
        }

        let record = log.read(self.payloads.payload_at(payload_index))?;
        let stored_fp = Fingerprint::from_key::<C>(record.key);
        if C::NUMBER_EXTRA_BITS > 1 {
            self.payloads
                .set_reserve_bits_at(stored_fp.suffix_from(fp_index), payload_index, 0);
        }

        if stored_fp.matches_suffix(fp, fp_index) {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Inserts or updates a fingerprint's payload pointer.
    pub fn write(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        fp_index: usize,
        payload: u64,
        guarantee_update: bool,
    ) -> Result<WriteOutcome> {
        if C::DHT_MODE {
            return self.write_dht(fp, log, fp_index, payload, guarantee_update);
        }

        let lslot = fp.lslot_bits(fp_index);
        let ten = self.tenancy(lslot);
        let info = self.block_info();

        if info.remaining_bits <= C::EXTENSION_THRESHOLD && !guarantee_update {
            return Ok(WriteOutcome::BlockFull);
        }
        if !self.payloads.has_space() && !guarantee_update {
            return Ok(WriteOutcome::PayloadFull);
        }
        if lslot >= info.first_extended_lslot {
            return Ok(WriteOutcome::LslotExtended);
        }

        let last = Self::last_available(info.first_extended_lslot);

        if ten == 0 {
            let payload_index = self.payload_start(lslot);
            self.bits.set(lslot, true);
            self.bits.shift(1, 64 + payload_index, last);
            self.bits.set(64 + payload_index, true);
            self.payloads.shift_right_from(payload_index, 1);
            self.set_payload(fp, fp_index, payload_index, payload);
            return Ok(WriteOutcome::Inserted);
        }

        let (payload_run_start, offset) = self.locate(fp, fp_index);
        let payload_index = payload_run_start + offset;
        let (lslot_bits_start, lslot_bits_end) = self.lslot_bit_range(lslot);

        let mut trie = TenancyTrie::decode(&self.bits, lslot_bits_start, ten, fp_index);

        // Decide update vs. insert: reserve bits first, the log only when
        // they cannot disprove equality.
        let mut first_diff = None;
        if C::NUMBER_EXTRA_BITS > 1 {
            let (valid, extra) = self.payloads.reserve_bits_at(payload_index);
            let diff = (extra ^ fp.suffix_from(fp_index)).trailing_zeros();
            if diff < valid {
                first_diff = Some(fp_index + diff as usize);
            }
        }

        if first_diff.is_none() {
            let record = log.read(self.payloads.payload_at(payload_index))?;
            let mut stored_fp = Fingerprint::from_key::<C>(record.key);
            if stored_fp.matches_suffix(fp, fp_index) {
                self.set_payload(fp, fp_index, payload_index, payload);
                return Ok(WriteOutcome::Updated);
            }
            if C::NUMBER_EXTRA_BITS > 1 {
                self.payloads.set_reserve_bits_at(
                    stored_fp.suffix_from(fp_index),
                    payload_index,
                    0,
                );
            }
            // Displaced l-slots run under a rewritten index; realign before
            // diffing.
            stored_fp.set_lslot_bits(lslot, fp_index);
            first_diff = Some(fp.first_diff_index(&stored_fp));
        }

        let first_diff = first_diff.expect("resolved above");
        trie.insert(fp, first_diff);
        let encoded = trie.encode();

        let step = encoded.len as i64 - (lslot_bits_end - lslot_bits_start) as i64;
        if step > info.remaining_bits as i64 {
            return Ok(WriteOutcome::BlockFull);
        }

        self.bits.shift(step, lslot_bits_start, last);
        self.bits
            .set_range(lslot_bits_start, lslot_bits_start + encoded.len, encoded.bits);
        self.bits.shift(1, 64 + payload_index, last);
        self.bits.set(64 + payload_index, false);

        let payload_index = payload_run_start + trie.offset(fp);
        self.payloads.shift_right_from(payload_index, 1);
        self.set_payload(fp, fp_index, payload_index, payload);
        Ok(WriteOutcome::Inserted)
    }

    /// Removes a fingerprint. `NotFound` when the log record disagrees.
    pub fn remove(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        fp_index: usize,
    ) -> Result<RemoveOutcome> {
        if C::DHT_MODE {
            return self.remove_dht(fp, log, fp_index);
        }

        let lslot = fp.lslot_bits(fp_index);
        let ten = self.tenancy(lslot);
        let info = self.block_info();

        if lslot >= info.first_extended_lslot {
            return Ok(RemoveOutcome::LslotExtended);
        }
        if ten == 0 {
            return Ok(RemoveOutcome::NotFound);
        }

        let last = Self::last_available(info.first_extended_lslot);

        if ten == 1 {
            let payload_index = self.payload_start(lslot);
            let record = log.read(self.payloads.payload_at(payload_index))?;
            let stored_fp = Fingerprint::from_key::<C>(record.key);
            if !stored_fp.matches_suffix(fp, fp_index) {
                return Ok(RemoveOutcome::NotFound);
            }

            self.bits.set(lslot, false);
            self.bits.shift(-1, 64 + payload_index, last);
            self.payloads.shift_left_from(payload_index, 1);
            return Ok(RemoveOutcome::Removed);
        }

        let (payload_run_start, offset) = self.locate(fp, fp_index);
        let payload_index = payload_run_start + offset;
        let (lslot_bits_start, lslot_bits_end) = self.lslot_bit_range(lslot);

        let record = log.read(self.payloads.payload_at(payload_index))?;
        let stored_fp = Fingerprint::from_key::<C>(record.key);
        if !stored_fp.matches_suffix(fp, fp_index) {
            return Ok(RemoveOutcome::NotFound);
        }

        let mut trie = TenancyTrie::decode(&self.bits, lslot_bits_start, ten, fp_index);
        trie.remove(fp);
        let encoded = trie.encode();

        let step = encoded.len as i64 - (lslot_bits_end - lslot_bits_start) as i64;
        self.bits.shift(step, lslot_bits_start, last);
        self.bits
            .set_range(lslot_bits_start, lslot_bits_start + encoded.len, encoded.bits);
        self.bits.shift(-1, 64 + payload_run_start, last);
        self.payloads.shift_left_from(payload_index, 1);
        Ok(RemoveOutcome::Removed)
    }

    fn set_payload(&mut self, fp: &Fingerprint, fp_index: usize, index: usize, payload: u64) {
        self.payloads.set_payload_at(index, payload);
        if C::NUMBER_EXTRA_BITS > 1 {
            self.payloads
                .set_reserve_bits_at(fp.suffix_from(fp_index), index, 0);
        }
    }

    /// Splices a whole l-slot (tenancy run, trie bits, payload entries)
    /// into this block. Used by extension displacement and the split.
    pub fn install_lslot(
        &mut self,
        lslot: usize,
        ten: usize,
        encoded: TrieBits,
        source: &PayloadList<C>,
        source_start: usize,
        age: bool,
    ) {
        // Shifts must stop short of the boundary marker of an already
        // extended block.
        let last = Self::last_available(self.block_info().first_extended_lslot);

        self.set_tenancy(lslot, ten, last);
        if ten == 0 {
            return;
        }

        let start = self.lslot_start(lslot);
        self.bits.shift(encoded.len as i64, start, last);
        self.bits.set_range(start, start + encoded.len, encoded.bits);

        let payload_index = self.payload_start(lslot);
        self.payloads.shift_right_from(payload_index, ten);
        for i in 0..ten {
            PayloadList::transfer(source, source_start + i, &mut self.payloads, payload_index + i, age);
        }
    }

    /// The trie bit at `fp_index` of the l-slot member at `payload_index`,
    /// read from reserve bits when they are still valid, else from the log.
    pub fn first_trie_bit(
        &mut self,
        log: &SsdLog<C>,
        payload_index: usize,
        fp_index: usize,
    ) -> Result<bool> {
        if C::NUMBER_EXTRA_BITS > 1 {
            let (valid, extra) = self.payloads.reserve_bits_at(payload_index);
            if valid > 0 {
                return Ok(extra & 1 == 1);
            }
        }
        let record = log.read(self.payloads.payload_at(payload_index))?;
        let fp = Fingerprint::from_key::<C>(record.key);
        if C::NUMBER_EXTRA_BITS > 1 {
            self.payloads
                .set_reserve_bits_at(fp.suffix_from(fp_index), payload_index, 0);
        }
        Ok(fp.get(fp_index))
    }

    // --- DHT mode ---------------------------------------------------------
    //
    // No trie bits at all: an l-slot is its tenancy run, candidates are
    // scanned against reserve bits and the log.

    fn read_dht(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        fp_index: usize,
    ) -> Result<Option<Record>> {
        let lslot = fp.lslot_bits(fp_index);
        let ten = self.tenancy(lslot);
        let start = self.payload_start(lslot);

        for i in 0..ten {
            let payload_index = start + i;
            if C::NUMBER_EXTRA_BITS > 1 {
                let (valid, extra) = self.payloads.reserve_bits_at(payload_index);
                let chunk = if valid == 0 {
                    0
                } else {
                    fp.suffix_from(fp_index) & ((1u64 << valid) - 1)
                };
                if chunk != extra {
                    continue;
                }
            }
            let record = log.read(self.payloads.payload_at(payload_index))?;
            let stored_fp = Fingerprint::from_key::<C>(record.key);
            if stored_fp.matches_suffix(fp, fp_index) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn write_dht(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        fp_index: usize,
        payload: u64,
        guarantee_update: bool,
    ) -> Result<WriteOutcome> {
        let lslot = fp.lslot_bits(fp_index);
        let ten = self.tenancy(lslot);
        let info = self.block_info();

        if info.remaining_bits <= C::EXTENSION_THRESHOLD && !guarantee_update {
            return Ok(WriteOutcome::BlockFull);
        }
        if !self.payloads.has_space() && !guarantee_update {
            return Ok(WriteOutcome::PayloadFull);
        }
        if lslot >= info.first_extended_lslot {
            return Ok(WriteOutcome::LslotExtended);
        }

        let start = self.payload_start(lslot);

        // Update in place when the key is already present.
        for i in 0..ten {
            let record = log.read(self.payloads.payload_at(start + i))?;
            let stored_fp = Fingerprint::from_key::<C>(record.key);
            if stored_fp.matches_suffix(fp, fp_index) {
                self.set_payload(fp, fp_index, start + i, payload);
                return Ok(WriteOutcome::Updated);
            }
        }

        let last = Self::last_available(info.first_extended_lslot);
        self.bits.shift(1, 64 + start, last);
        self.bits.set(64 + start, ten == 0);
        self.bits.set(lslot, true);
        self.payloads.shift_right_from(start, 1);
        self.set_payload(fp, fp_index, start, payload);
        Ok(WriteOutcome::Inserted)
    }

    fn remove_dht(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        fp_index: usize,
    ) -> Result<RemoveOutcome> {
        let lslot = fp.lslot_bits(fp_index);
        let ten = self.tenancy(lslot);
        let info = self.block_info();

        if lslot >= info.first_extended_lslot {
            return Ok(RemoveOutcome::LslotExtended);
        }

        let start = self.payload_start(lslot);
        let last = Self::last_available(info.first_extended_lslot);

        for i in 0..ten {
            let record = log.read(self.payloads.payload_at(start + i))?;
            let stored_fp = Fingerprint::from_key::<C>(record.key);
            if stored_fp.matches_suffix(fp, fp_index) {
                if ten == 1 {
                    self.bits.set(lslot, false);
                }
                self.bits.shift(-1, 64 + start, last);
                self.payloads.shift_left_from(start + i, 1);
                return Ok(RemoveOutcome::Removed);
            }
        }
        Ok(RemoveOutcome::NotFound)
    }
}
