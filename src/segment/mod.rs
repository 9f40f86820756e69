// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A segment: 64 home blocks plus a ring of extension blocks.
//!
//! The segment routes fingerprint operations to the home block selected by
//! the 6 bits below the l-slot field, redirecting l-slots beyond a block's
//! extension boundary into the ring. Overflow statuses from blocks are
//! resolved here: displacement into the ring first, and when the ring
//! cannot absorb enough, the segment reports itself full so the directory
//! can split it.
//!
//! A split partitions the segment by the fingerprint bit at `fp_index`.
//! Geometrically the whole of block `b` routes to successor `b & 1`; each
//! l-slot `l` lands in block `(b >> 1) | ((l & 1) << 5)` and is cut at the
//! trie root into new l-slots `l >> 1` (zero side) and `(l >> 1) | 32`
//! (one side). No rehashing happens: trie subtrees and payload entries
//! move structurally, with reserve bits aged by the consumed routing bit.

use crate::block::{Block, RemoveOutcome, WriteOutcome};
use crate::coding::Record;
use crate::config::{Config, LSLOT_COUNT};
use crate::error::{Error, Result};
use crate::extension::ExtensionBlock;
use crate::fingerprint::Fingerprint;
use crate::payload::PayloadList;
use crate::ssd_log::SsdLog;
use crate::trie::{TenancyTrie, TrieBits};

/// Result of a segment-level write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SegmentWrite {
    Inserted,
    Updated,
    /// Neither the home block nor the ring can absorb the insertion; the
    /// segment must split.
    Full,
}

/// Result of a segment-level remove.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SegmentRemove {
    Removed,
    NotFound,
}

/// One directory-addressable unit of the store.
pub struct Segment<C: Config> {
    fp_index: usize,
    blocks: Vec<Block<C>>,
    extensions: Vec<ExtensionBlock<C>>,
}

impl<C: Config> Segment<C> {
    #[must_use]
    pub fn new(fp_index: usize) -> Self {
        Self {
            fp_index,
            blocks: (0..LSLOT_COUNT).map(|_| Block::new()).collect(),
            extensions: (0..C::EXTENSION_BLOCK_COUNT)
                .map(|_| ExtensionBlock::new())
                .collect(),
        }
    }

    /// Directory depth at which this segment was born.
    #[must_use]
    pub fn fp_index(&self) -> usize {
        self.fp_index
    }

    pub fn read(&mut self, fp: &Fingerprint, log: &SsdLog<C>) -> Result<Option<Record>> {
        let block_idx = fp.block_bits(self.fp_index);
        let lslot = fp.lslot_bits(self.fp_index);
        let boundary = self.blocks[block_idx].block_info().first_extended_lslot;

        if lslot >= boundary {
            let ring_idx = ExtensionBlock::<C>::ring_index(block_idx, lslot);
            let ordinal = ExtensionBlock::<C>::ordinal(lslot);
            self.extensions[ring_idx].read(fp, log, self.fp_index, block_idx, ordinal)
        } else {
            self.blocks[block_idx].read(fp, log, self.fp_index)
        }
    }

    pub fn write(
        &mut self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        payload: u64,
        guarantee_update: bool,
    ) -> Result<SegmentWrite> {
        let block_idx = fp.block_bits(self.fp_index);

        loop {
            let outcome = self.blocks[block_idx].write(
                fp,
                log,
                self.fp_index,
                payload,
                guarantee_update,
            )?;
            match outcome {
                WriteOutcome::Inserted => return Ok(SegmentWrite::Inserted),
                WriteOutcome::Updated => return Ok(SegmentWrite::Updated),
                WriteOutcome::LslotExtended => {
                    let lslot = fp.lslot_bits(self.fp_index);
                    let ring_idx = ExtensionBlock::<C>::ring_index(block_idx, lslot);
                    let ordinal = ExtensionBlock::<C>::ordinal(lslot);
                    return match self.extensions[ring_idx].write(
                        fp,
                        log,
                        self.fp_index,
                        payload,
                        block_idx,
                        ordinal,
                        guarantee_update,
                    )? {
                        WriteOutcome::Inserted => Ok(SegmentWrite::Inserted),
                        WriteOutcome::Updated => Ok(SegmentWrite::Updated),
                        // An extension block cannot be displaced further.
                        _ => Ok(SegmentWrite::Full),
                    };
                }
                WriteOutcome::BlockFull | WriteOutcome::PayloadFull => {
                    let boundary = self.blocks[block_idx].block_info().first_extended_lslot;
                    if boundary == 0
                        || !ExtensionBlock::make_room(
                            &mut self.blocks[block_idx],
                            &mut self.extensions,
                            block_idx,
                            boundary - 1,
                        )
                    {
                        return Ok(SegmentWrite::Full);
                    }
                    // Displacement freed space (or moved the target l-slot
                    // into the ring); retry.
                }
            }
        }
    }

    pub fn remove(&mut self, fp: &Fingerprint, log: &SsdLog<C>) -> Result<SegmentRemove> {
        let block_idx = fp.block_bits(self.fp_index);
        let lslot = fp.lslot_bits(self.fp_index);
        let boundary = self.blocks[block_idx].block_info().first_extended_lslot;

        let outcome = if lslot >= boundary {
            let ring_idx = ExtensionBlock::<C>::ring_index(block_idx, lslot);
            let ordinal = ExtensionBlock::<C>::ordinal(lslot);
            self.extensions[ring_idx].remove(fp, log, self.fp_index, block_idx, ordinal)?
        } else {
            self.blocks[block_idx].remove(fp, log, self.fp_index)?
        };

        match outcome {
            RemoveOutcome::Removed => Ok(SegmentRemove::Removed),
            RemoveOutcome::NotFound => Ok(SegmentRemove::NotFound),
            RemoveOutcome::LslotExtended => {
                debug_assert!(false, "redirection resolved before block dispatch");
                Ok(SegmentRemove::NotFound)
            }
        }
    }

    /// Number of fingerprints stored in the segment.
    #[must_use]
    pub fn total_tenancy(&self) -> usize {
        let home: usize = self
            .blocks
            .iter()
            .map(|b| b.total_tenancy(b.block_info().first_extended_lslot))
            .sum();
        let displaced: usize = self
            .extensions
            .iter()
            .map(|e| e.block.payloads.occupied())
            .sum();
        home + displaced
    }

    /// Splits into two successors partitioned by the bit at `fp_index`.
    ///
    /// The log is consulted only where reserve bits cannot name an
    /// l-slot's routing bit; fingerprints are never rehashed.
    pub fn split(&mut self, log: &SsdLog<C>) -> Result<(Segment<C>, Segment<C>)> {
        debug_assert!(!C::DHT_MODE, "DHT segments do not split");

        let fp_index = self.fp_index;
        log::debug!("splitting segment with fp_index {fp_index}");

        let mut zero = Segment::new(fp_index + 1);
        let mut one = Segment::new(fp_index + 1);

        for block_idx in 0..LSLOT_COUNT {
            let boundary = self.blocks[block_idx].block_info().first_extended_lslot;
            for lslot in 0..LSLOT_COUNT {
                if lslot < boundary {
                    let ten = self.blocks[block_idx].tenancy(lslot);
                    if ten == 0 {
                        continue;
                    }
                    let (start, _) = self.blocks[block_idx].lslot_bit_range(lslot);
                    let payload_start = self.blocks[block_idx].payload_start(lslot);
                    Self::split_lslot(
                        &mut self.blocks[block_idx],
                        start,
                        ten,
                        payload_start,
                        block_idx,
                        lslot,
                        fp_index,
                        &mut zero,
                        &mut one,
                        log,
                    )?;
                } else {
                    let ring_idx = ExtensionBlock::<C>::ring_index(block_idx, lslot);
                    let ordinal = ExtensionBlock::<C>::ordinal(lslot);
                    let ten = self.extensions[ring_idx].tenancy_of(block_idx, ordinal);
                    if ten == 0 {
                        continue;
                    }
                    let physical = self.extensions[ring_idx].physical_index(block_idx, ordinal);
                    let ext = &mut self.extensions[ring_idx];
                    let (start, _) = ext.block.lslot_bit_range(physical);
                    let payload_start = ext.block.payload_start(physical);
                    Self::split_lslot(
                        &mut ext.block,
                        start,
                        ten,
                        payload_start,
                        block_idx,
                        lslot,
                        fp_index,
                        &mut zero,
                        &mut one,
                        log,
                    )?;
                }
            }
        }

        debug_assert_eq!(
            self.total_tenancy(),
            zero.total_tenancy() + one.total_tenancy(),
            "split must conserve tenancy",
        );
        Ok((zero, one))
    }

    /// Cuts one source l-slot at the routing bit and installs the halves.
    #[allow(clippy::too_many_arguments)]
    fn split_lslot(
        source: &mut Block<C>,
        trie_start: usize,
        ten: usize,
        payload_start: usize,
        block_idx: usize,
        lslot: usize,
        fp_index: usize,
        zero: &mut Segment<C>,
        one: &mut Segment<C>,
        log: &SsdLog<C>,
    ) -> Result<()> {
        let trie = TenancyTrie::decode(&source.bits, trie_start, ten, fp_index);

        let split_at_root = ten >= 2 && trie.root_depth() == Some(fp_index);
        let zero_count = if split_at_root {
            trie.zero_side_leaves()
        } else if source.first_trie_bit(log, payload_start, fp_index)? {
            0
        } else {
            ten
        };

        let successor = if block_idx & 1 == 0 { zero } else { one };
        let new_block = (block_idx >> 1) | ((lslot & 1) << 5);

        if zero_count > 0 {
            let (part_root, part_ten) = if split_at_root {
                let root = trie.root_left();
                (root, trie.part_tenancy(root))
            } else {
                (trie.root(), ten)
            };
            let encoded = trie.encode_part(part_root, part_ten, fp_index + 1);
            successor.install_lslot(
                new_block,
                lslot >> 1,
                part_ten,
                encoded,
                &source.payloads,
                payload_start,
            )?;
        }
        if zero_count < ten {
            let (part_root, part_ten) = if split_at_root {
                let root = trie.root_right();
                (root, trie.part_tenancy(root))
            } else {
                (trie.root(), ten)
            };
            let encoded = trie.encode_part(part_root, part_ten, fp_index + 1);
            successor.install_lslot(
                new_block,
                (lslot >> 1) | (LSLOT_COUNT >> 1),
                part_ten,
                encoded,
                &source.payloads,
                payload_start + zero_count,
            )?;
        }
        Ok(())
    }

    /// Installs a whole l-slot, displacing into the ring when the target
    /// block is short on space.
    fn install_lslot(
        &mut self,
        block_idx: usize,
        lslot: usize,
        ten: usize,
        encoded: TrieBits,
        source: &PayloadList<C>,
        source_start: usize,
    ) -> Result<()> {
        if ten == 0 {
            return Ok(());
        }

        loop {
            let info = self.blocks[block_idx].block_info();

            if lslot >= info.first_extended_lslot {
                let ring_idx = ExtensionBlock::<C>::ring_index(block_idx, lslot);
                let ordinal = ExtensionBlock::<C>::ordinal(lslot);
                let ext = &mut self.extensions[ring_idx];
                let ext_info = ext.block.block_info();
                if ten + encoded.len > ext_info.remaining_bits || ten > ext_info.remaining_payload {
                    return Err(Error::NoSpace);
                }
                ext.install_displaced(block_idx, ordinal, ten, encoded, source, source_start);
                return Ok(());
            }

            if ten + encoded.len <= info.remaining_bits && ten <= info.remaining_payload {
                self.blocks[block_idx]
                    .install_lslot(lslot, ten, encoded, source, source_start, true);
                return Ok(());
            }

            if info.first_extended_lslot == 0
                || !ExtensionBlock::make_room(
                    &mut self.blocks[block_idx],
                    &mut self.extensions,
                    block_idx,
                    info.first_extended_lslot - 1,
                )
            {
                return Err(Error::NoSpace);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, MemoryReserveConfig};
    use test_log::test;

    const FP_INDEX: usize = 12;

    fn fill<C: Config>(
        segment: &mut Segment<C>,
        log: &SsdLog<C>,
        count: u64,
    ) -> crate::Result<Vec<u64>> {
        let mut keys = vec![];
        for key in 0..count {
            let payload = log.write(key, key * 2)?;
            let fp = Fingerprint::from_key::<C>(key);
            match segment.write(&fp, log, payload, false)? {
                SegmentWrite::Inserted => keys.push(key),
                SegmentWrite::Updated => panic!("keys are distinct"),
                SegmentWrite::Full => break,
            }
        }
        Ok(keys)
    }

    #[test]
    fn segment_write_read_remove() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 256)?;
        let mut segment = Segment::<MemoryConfig>::new(FP_INDEX);

        let keys = fill(&mut segment, &log, 2000)?;
        assert_eq!(2000, keys.len(), "a fresh segment holds 2000 keys");
        assert_eq!(2000, segment.total_tenancy());

        for key in &keys {
            let fp = Fingerprint::from_key::<MemoryConfig>(*key);
            let record = segment.read(&fp, &log)?.expect("present");
            assert_eq!(key * 2, record.value);
        }

        let absent = Fingerprint::from_key::<MemoryConfig>(1 << 40);
        assert_eq!(None, segment.read(&absent, &log)?);
        assert_eq!(SegmentRemove::NotFound, segment.remove(&absent, &log)?);

        for key in &keys {
            let fp = Fingerprint::from_key::<MemoryConfig>(*key);
            assert_eq!(SegmentRemove::Removed, segment.remove(&fp, &log)?);
        }
        assert_eq!(0, segment.total_tenancy());
        Ok(())
    }

    #[test]
    fn segment_update_in_place() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 64)?;
        let mut segment = Segment::<MemoryConfig>::new(FP_INDEX);

        let fp = Fingerprint::from_key::<MemoryConfig>(42);
        let first = log.write(42, 1)?;
        assert_eq!(SegmentWrite::Inserted, segment.write(&fp, &log, first, false)?);

        let second = log.write(42, 2)?;
        assert_eq!(SegmentWrite::Updated, segment.write(&fp, &log, second, false)?);

        assert_eq!(1, segment.total_tenancy());
        assert_eq!(2, segment.read(&fp, &log)?.expect("present").value);
        Ok(())
    }

    #[test]
    fn segment_displacement_keeps_keys_readable() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 1024)?;
        let mut segment = Segment::<MemoryConfig>::new(FP_INDEX);

        // Push far past the comfortable fill so displacement kicks in.
        let keys = fill(&mut segment, &log, 4600)?;
        assert!(keys.len() > 3800, "got {}", keys.len());

        let extended = segment
            .blocks
            .iter()
            .filter(|b| b.block_info().extended)
            .count();
        assert!(extended > 0, "displacement should have happened");

        for key in &keys {
            let fp = Fingerprint::from_key::<MemoryConfig>(*key);
            let record = segment.read(&fp, &log)?.expect("present");
            assert_eq!(key * 2, record.value);
        }
        Ok(())
    }

    #[test]
    fn segment_split_conserves_and_routes() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 1024)?;
        let mut segment = Segment::<MemoryConfig>::new(FP_INDEX);

        let keys = fill(&mut segment, &log, 3000)?;
        let before = segment.total_tenancy();
        assert_eq!(keys.len(), before);

        let (mut zero, mut one) = segment.split(&log)?;
        assert_eq!(FP_INDEX + 1, zero.fp_index());
        assert_eq!(before, zero.total_tenancy() + one.total_tenancy());

        for key in &keys {
            let fp = Fingerprint::from_key::<MemoryConfig>(*key);
            let successor = if fp.block_bits(FP_INDEX) & 1 == 0 {
                &mut zero
            } else {
                &mut one
            };
            let record = successor.read(&fp, &log)?.expect("key must survive the split");
            assert_eq!(*key, record.key);
            assert_eq!(key * 2, record.value);
        }
        Ok(())
    }

    #[test]
    fn segment_split_with_reserve_bits() -> crate::Result<()> {
        let log = SsdLog::<MemoryReserveConfig>::create("unused", 1024)?;
        let mut segment = Segment::<MemoryReserveConfig>::new(FP_INDEX);

        let keys = fill(&mut segment, &log, 2500)?;
        let (mut zero, mut one) = segment.split(&log)?;

        for key in &keys {
            let fp = Fingerprint::from_key::<MemoryReserveConfig>(*key);
            let successor = if fp.block_bits(FP_INDEX) & 1 == 0 {
                &mut zero
            } else {
                &mut one
            };
            assert_eq!(
                key * 2,
                successor.read(&fp, &log)?.expect("present").value,
            );
        }
        Ok(())
    }

    #[test]
    fn segment_split_after_displacement() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 1024)?;
        let mut segment = Segment::<MemoryConfig>::new(FP_INDEX);

        let keys = fill(&mut segment, &log, 4600)?;
        let extended = segment
            .blocks
            .iter()
            .filter(|b| b.block_info().extended)
            .count();
        assert!(extended > 0);

        let before = segment.total_tenancy();
        let (mut zero, mut one) = segment.split(&log)?;
        assert_eq!(before, zero.total_tenancy() + one.total_tenancy());

        for key in &keys {
            let fp = Fingerprint::from_key::<MemoryConfig>(*key);
            let successor = if fp.block_bits(FP_INDEX) & 1 == 0 {
                &mut zero
            } else {
                &mut one
            };
            assert_eq!(key * 2, successor.read(&fp, &log)?.expect("present").value);
        }
        Ok(())
    }
}
