// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Overflow vessel for l-slots displaced out of their home block.
//!
//! An extension block is a [`Block`] plus a 128-bit side map: word 0 marks
//! which source blocks own displaced l-slots here, word 1 holds one unary
//! run per marked block giving how many. The physical l-slot space of the
//! inner block is compact and ordered by (source block, ordinal), so
//! locating `(block, k)` is a rank/select over the side map.
//!
//! Displaced l-slots of one source block are spread round-robin over the
//! segment's ring: l-slot `l` of block `b` lands in ring slot
//! `(b + 64 - l - 1) % K` as its `(64 - l - 1) / K`-th entry. Whole
//! l-slots move, never individual fingerprints; the home block keeps its
//! (dead) occupancy and tenancy bits beyond the boundary and re-encodes
//! the boundary marker in its word-3 tail.

use crate::bitvec::BitVec;
use crate::block::{Block, RemoveOutcome, WriteOutcome};
use crate::coding::Record;
use crate::config::{Config, LSLOT_COUNT};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::payload::PayloadList;
use crate::ssd_log::SsdLog;

/// Displaced-l-slot counts for one source block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct SideInfo {
    /// Displaced l-slots owned by blocks with a smaller index.
    before: usize,
    /// Displaced l-slots owned by this block.
    count: usize,
}

/// An extension block of a segment.
#[derive(Clone)]
pub struct ExtensionBlock<C: Config> {
    side_map: BitVec<2>,
    pub(crate) block: Block<C>,
}

impl<C: Config> Default for ExtensionBlock<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> ExtensionBlock<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            side_map: BitVec::new(),
            block: Block::new(),
        }
    }

    /// Ring slot receiving l-slot `lslot` of block `block_idx`.
    #[must_use]
    pub fn ring_index(block_idx: usize, lslot: usize) -> usize {
        (block_idx + LSLOT_COUNT - lslot - 1) % C::EXTENSION_BLOCK_COUNT
    }

    /// Ordinal of `lslot` among its block's l-slots in the same ring slot.
    #[must_use]
    pub fn ordinal(lslot: usize) -> usize {
        (LSLOT_COUNT - lslot - 1) / C::EXTENSION_BLOCK_COUNT
    }

    fn side_info(&self, block_idx: usize) -> SideInfo {
        let rank = self.side_map.rank(block_idx);
        if rank == 0 {
            let count = if self.side_map.get(block_idx) {
                self.side_map.select_from(1, 1) + 1
            } else {
                0
            };
            return SideInfo { before: 0, count };
        }
        if self.side_map.get(block_idx) {
            let (first, second) = self.side_map.select_two(rank, rank + 1, 1);
            SideInfo {
                before: first + 1,
                count: second - first,
            }
        } else {
            SideInfo {
                before: self.side_map.select_from(rank, 1) + 1,
                count: 0,
            }
        }
    }

    /// Physical l-slot index of `(block_idx, ordinal)` in the inner block.
    #[must_use]
    pub fn physical_index(&self, block_idx: usize, ordinal: usize) -> usize {
        let blocks_before = self.side_map.rank(block_idx);
        let lslots_before = if blocks_before == 0 {
            0
        } else {
            self.side_map.select_from(blocks_before, 1) + 1
        };
        lslots_before + ordinal
    }

    /// Free bits in the side map's run area.
    fn side_bits_remaining(&self) -> usize {
        self.side_map.leading_zeros_in_word(1)
    }

    /// Allocates the side-map run and physical l-slot for a first-time
    /// displacement of `(block_idx, ordinal)`. No-op when already present.
    fn register_lslot(&mut self, block_idx: usize, ordinal: usize) {
        let info = self.side_info(block_idx);
        debug_assert!(ordinal <= info.count, "displacements arrive in ordinal order");
        if ordinal != info.count {
            return;
        }

        let physical = self.physical_index(block_idx, ordinal);
        self.side_map.shift(1, 64 + info.before, BitVec::<2>::BITS);
        if self.side_map.get(block_idx) {
            self.side_map.set(64 + info.before, false);
        } else {
            debug_assert_eq!(0, info.count);
            self.side_map.set(block_idx, true);
            self.side_map.set(64 + info.before, true);
        }

        // The inner block's occupancy space is compact: open a position.
        self.block.bits.shift(1, physical, LSLOT_COUNT);
        self.block.bits.set(physical, false);
    }

    fn rewritten(fp: &Fingerprint, physical: usize, fp_index: usize) -> Fingerprint {
        let mut fp = *fp;
        fp.set_lslot_bits(physical, fp_index);
        fp
    }

    pub fn read(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        fp_index: usize,
        block_idx: usize,
        ordinal: usize,
    ) -> Result<Option<Record>> {
        let physical = self.physical_index(block_idx, ordinal);
        let fp = Self::rewritten(fp, physical, fp_index);
        self.block.read(&fp, log, fp_index)
    }

    pub fn write(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        fp_index: usize,
        payload: u64,
        block_idx: usize,
        ordinal: usize,
        guarantee_update: bool,
    ) -> Result<WriteOutcome> {
        self.register_lslot(block_idx, ordinal);
        let physical = self.physical_index(block_idx, ordinal);
        let fp = Self::rewritten(fp, physical, fp_index);
        self.block.write(&fp, log, fp_index, payload, guarantee_update)
    }

    pub fn remove(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        fp_index: usize,
        block_idx: usize,
        ordinal: usize,
    ) -> Result<RemoveOutcome> {
        let physical = self.physical_index(block_idx, ordinal);
        let fp = Self::rewritten(fp, physical, fp_index);
        self.block.remove(&fp, log, fp_index)
    }

    /// Installs a whole l-slot directly into this extension block.
    ///
    /// Used by the split when a successor's home block already redirects
    /// the target l-slot.
    pub(crate) fn install_displaced(
        &mut self,
        block_idx: usize,
        ordinal: usize,
        ten: usize,
        encoded: crate::trie::TrieBits,
        source: &PayloadList<C>,
        source_start: usize,
    ) {
        self.register_lslot(block_idx, ordinal);
        let physical = self.physical_index(block_idx, ordinal);
        self.block
            .install_lslot(physical, ten, encoded, source, source_start, true);
    }

    /// Tenancy of a displaced l-slot.
    #[must_use]
    pub fn tenancy_of(&self, block_idx: usize, ordinal: usize) -> usize {
        let info = self.side_info(block_idx);
        if ordinal >= info.count {
            return 0;
        }
        self.block.tenancy(self.physical_index(block_idx, ordinal))
    }

    /// Lowest home l-slot the ring can absorb, displacing backwards from
    /// `top_lslot` until the home block's reclaimed bits cover a pending
    /// insertion. `None` when no extension can take enough.
    fn displacement_target(
        home: &Block<C>,
        ring: &[Self],
        top_lslot: usize,
        start_ring: usize,
    ) -> Option<usize> {
        let home_info = home.block_info();
        let mut home_change: i64 = 0;
        let mut block_bits = vec![0i64; ring.len()];
        let mut side_bits = vec![0i64; ring.len()];
        let mut payloads = vec![0i64; ring.len()];

        for curr in (1..=top_lslot).rev() {
            let ring_idx = (start_ring + (top_lslot - curr)) % ring.len();
            let ext = &ring[ring_idx];
            let ext_info = ext.block.block_info();

            let (start, end) = home.lslot_bit_range(curr);
            let len = (end - start) as i64;
            let ten = home.tenancy(curr) as i64;

            block_bits[ring_idx] += ten + len;
            side_bits[ring_idx] += 1;
            payloads[ring_idx] += ten;
            home_change += 1 - len;

            if block_bits[ring_idx] > ext_info.remaining_bits as i64
                || side_bits[ring_idx] > ext.side_bits_remaining() as i64
                || payloads[ring_idx] > ext_info.remaining_payload as i64
            {
                return None;
            }
            if home_change <= home_info.remaining_bits as i64 {
                return Some(curr);
            }
        }
        None
    }

    /// Displaces whole l-slots from the top of `home` into the ring until
    /// the home block has room again. Returns false when the ring cannot
    /// absorb enough; the segment must split.
    pub(crate) fn make_room(
        home: &mut Block<C>,
        ring: &mut [Self],
        block_idx: usize,
        top_lslot: usize,
    ) -> bool {
        let start_ring = Self::ring_index(block_idx, top_lslot);
        let Some(till) = Self::displacement_target(home, ring, top_lslot, start_ring) else {
            return false;
        };

        let old_marker = 3 * 64 + (63 - home.bits.leading_zeros_in_word(3));

        for curr in (till..=top_lslot).rev() {
            let ring_idx = (start_ring + (top_lslot - curr)) % ring.len();
            let ordinal = Self::ordinal(curr);
            let (start, end) = home.lslot_bit_range(curr);
            let len = end - start;
            let ten = home.tenancy(curr);

            let ext = &mut ring[ring_idx];
            ext.register_lslot(block_idx, ordinal);
            let physical = ext.physical_index(block_idx, ordinal);
            ext.block.set_tenancy(physical, ten, BitVec::<4>::BITS - 1);
            if ten == 0 {
                continue;
            }

            let new_start = ext.block.lslot_start(physical);
            ext.block.bits.shift(len as i64, new_start, BitVec::<4>::BITS - 1);
            ext.block
                .bits
                .set_range(new_start, new_start + len, home.bits.range(start, start + len));
            home.bits.set_range(start, start + len, 0);

            let old_payload = home.payload_start(curr);
            let new_payload = ext.block.payload_start(physical);
            ext.block.payloads.shift_right_from(new_payload, ten);
            for i in 0..ten {
                PayloadList::transfer(
                    &home.payloads,
                    old_payload + i,
                    &mut ext.block.payloads,
                    new_payload + i,
                    false,
                );
            }
            home.payloads.shift_left_from(old_payload, ten);
        }

        // Move the boundary marker down: one bit per displaced l-slot.
        let new_marker = old_marker - (top_lslot - till + 1);
        home.bits.set(new_marker, true);
        home.bits.set(old_marker, false);

        log::debug!(
            "displaced l-slots [{till}, {top_lslot}] of block {block_idx} into the extension ring",
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use test_log::test;

    const FP_INDEX: usize = 12;

    fn ring() -> Vec<ExtensionBlock<MemoryConfig>> {
        (0..MemoryConfig::EXTENSION_BLOCK_COUNT)
            .map(|_| ExtensionBlock::new())
            .collect()
    }

    #[test]
    fn extension_ring_layout() {
        // K = 4: the top l-slots of block 0 fan out over the ring.
        assert_eq!(0, ExtensionBlock::<MemoryConfig>::ring_index(0, 63));
        assert_eq!(1, ExtensionBlock::<MemoryConfig>::ring_index(0, 62));
        assert_eq!(2, ExtensionBlock::<MemoryConfig>::ring_index(0, 61));
        assert_eq!(3, ExtensionBlock::<MemoryConfig>::ring_index(0, 60));
        // every 4th l-slot shares a ring slot, with growing ordinals
        assert_eq!(0, ExtensionBlock::<MemoryConfig>::ring_index(0, 59));
        assert_eq!(0, ExtensionBlock::<MemoryConfig>::ordinal(63));
        assert_eq!(1, ExtensionBlock::<MemoryConfig>::ordinal(59));
        assert_eq!(2, ExtensionBlock::<MemoryConfig>::ordinal(55));
    }

    #[test]
    fn extension_register_and_physical_index() {
        let mut ext = ExtensionBlock::<MemoryConfig>::new();

        ext.register_lslot(5, 0);
        ext.register_lslot(5, 1);
        ext.register_lslot(2, 0);

        // block 2's l-slots come first in physical order
        assert_eq!(0, ext.physical_index(2, 0));
        assert_eq!(1, ext.physical_index(5, 0));
        assert_eq!(2, ext.physical_index(5, 1));

        assert_eq!(SideInfo { before: 1, count: 2 }, ext.side_info(5));
        assert_eq!(SideInfo { before: 0, count: 1 }, ext.side_info(2));
        assert_eq!(SideInfo { before: 3, count: 0 }, ext.side_info(9));
    }

    #[test]
    fn extension_write_read_remove() -> crate::Result<()> {
        let mut ext = ExtensionBlock::<MemoryConfig>::new();
        let log = SsdLog::<MemoryConfig>::create("unused", 16)?;

        let key = 77u64;
        let payload = log.write(key, 770)?;
        let fp = Fingerprint::from_key::<MemoryConfig>(key);

        let outcome = ext.write(&fp, &log, FP_INDEX, payload, 3, 0, false)?;
        assert_eq!(WriteOutcome::Inserted, outcome);

        let record = ext.read(&fp, &log, FP_INDEX, 3, 0)?.expect("present");
        assert_eq!(770, record.value);

        assert_eq!(
            RemoveOutcome::Removed,
            ext.remove(&fp, &log, FP_INDEX, 3, 0)?
        );
        assert_eq!(None, ext.read(&fp, &log, FP_INDEX, 3, 0)?);
        Ok(())
    }

    #[test]
    fn extension_make_room_preserves_entries() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 64)?;
        let mut home = Block::<MemoryConfig>::new();
        let mut ring = ring();

        // Fill the home block until it reports pressure.
        let mut keys = vec![];
        for key in 0..10_000u64 {
            let fp = Fingerprint::from_key::<MemoryConfig>(key);
            let payload = log.write(key, key * 3)?;
            match home.write(&fp, &log, FP_INDEX, payload, false)? {
                WriteOutcome::Inserted => keys.push(key),
                WriteOutcome::BlockFull | WriteOutcome::PayloadFull => break,
                outcome => panic!("unexpected {outcome:?}"),
            }
        }

        let info = home.block_info();
        assert!(!info.extended);
        assert!(ExtensionBlock::make_room(
            &mut home,
            &mut ring,
            0,
            info.first_extended_lslot - 1,
        ));

        let info = home.block_info();
        assert!(info.extended);
        let boundary = info.first_extended_lslot;
        assert!(boundary < LSLOT_COUNT);

        // Every key must still be readable, through the home block or the
        // ring depending on its l-slot.
        for key in &keys {
            let fp = Fingerprint::from_key::<MemoryConfig>(*key);
            let lslot = fp.lslot_bits(FP_INDEX);
            let record = if lslot < boundary {
                home.read(&fp, &log, FP_INDEX)?
            } else {
                let ring_idx = ExtensionBlock::<MemoryConfig>::ring_index(0, lslot);
                let ordinal = ExtensionBlock::<MemoryConfig>::ordinal(lslot);
                ring[ring_idx].read(&fp, &log, FP_INDEX, 0, ordinal)?
            };
            assert_eq!(key * 3, record.expect("key must survive displacement").value);
        }
        Ok(())
    }
}
