// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The growable directory of segments.
//!
//! A power-of-two vector of shared segment handles, indexed by the low
//! `depth` bits of the fingerprint. Doubling clones the vector into its
//! upper half in place, so both halves reference the same segments until
//! those segments split; a segment born at a shallower depth is referenced
//! by `2^(depth - (fp_index - 12))` entries, and its split rewrites
//! exactly those entries, alternating the two successors.
//!
//! Concurrency discipline: clone the handle under the read lock, lock the
//! segment, then re-check that the handle is still the one installed at
//! the fingerprint's index; a split in between makes the old segment
//! unreachable, so stale operations retry from the top.

pub mod pool;

use crate::coding::Record;
use crate::config::{Config, LSLOT_INDEX_BITS};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::segment::{Segment, SegmentRemove, SegmentWrite};
use crate::ssd_log::SsdLog;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// How a write settled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteKind {
    Inserted,
    Updated,
}

/// Outcome of a remove.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RemoveKind {
    Removed,
    NotFound,
}

/// A lockable, shared segment slot.
pub struct SegmentHandle<C: Config> {
    inner: Mutex<Segment<C>>,
}

/// Growable vector of shared segment handles.
pub struct Directory<C: Config> {
    segments: RwLock<Vec<Arc<SegmentHandle<C>>>>,
    depth: AtomicUsize,
    live_keys: AtomicUsize,
}

impl<C: Config> Directory<C> {
    /// Creates a directory of `2^depth` fresh segments.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        let fp_index = depth + 2 * LSLOT_INDEX_BITS;
        let segments = (0..1usize << depth)
            .map(|_| {
                Arc::new(SegmentHandle {
                    inner: Mutex::new(Segment::new(fp_index)),
                })
            })
            .collect();

        Self {
            segments: RwLock::new(segments),
            depth: AtomicUsize::new(depth),
            live_keys: AtomicUsize::new(0),
        }
    }

    /// Current directory depth (log2 of the entry count).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Number of keys currently stored.
    #[must_use]
    pub fn live_keys(&self) -> usize {
        self.live_keys.load(Ordering::Relaxed)
    }

    /// Number of distinct segments.
    #[must_use]
    pub fn unique_segments(&self) -> usize {
        let segments = self.segments.read().expect("lock poisoned");
        let mut seen: Vec<*const SegmentHandle<C>> =
            segments.iter().map(Arc::as_ptr).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    /// Tenancy summed over distinct segments; equals `live_keys` after any
    /// sequence of writes and removes.
    #[must_use]
    pub fn total_tenancy(&self) -> usize {
        // Clone the handles first: locking segments while holding the
        // directory lock would invert the write path's lock order.
        let handles: Vec<Arc<SegmentHandle<C>>> = {
            let segments = self.segments.read().expect("lock poisoned");
            let mut seen: Vec<&Arc<SegmentHandle<C>>> = segments.iter().collect();
            seen.sort_unstable_by_key(|h| Arc::as_ptr(h));
            seen.dedup_by_key(|h| Arc::as_ptr(h));
            seen.into_iter().map(Arc::clone).collect()
        };
        handles
            .iter()
            .map(|h| h.inner.lock().expect("lock poisoned").total_tenancy())
            .sum()
    }

    fn handle_for(&self, fp: &Fingerprint) -> Arc<SegmentHandle<C>> {
        let segments = self.segments.read().expect("lock poisoned");
        let depth = self.depth.load(Ordering::Acquire);
        Arc::clone(&segments[fp.segment_bits(depth)])
    }

    /// Whether `handle` is still the segment installed for `fp`.
    fn is_current(&self, fp: &Fingerprint, handle: &Arc<SegmentHandle<C>>) -> bool {
        let segments = self.segments.read().expect("lock poisoned");
        let depth = self.depth.load(Ordering::Acquire);
        Arc::ptr_eq(&segments[fp.segment_bits(depth)], handle)
    }

    pub fn read(&self, fp: &Fingerprint, log: &SsdLog<C>) -> Result<Option<Record>> {
        loop {
            let handle = self.handle_for(fp);
            let mut segment = handle.inner.lock().expect("lock poisoned");
            if !self.is_current(fp, &handle) {
                continue;
            }
            return segment.read(fp, log);
        }
    }

    pub fn write(
        &self,
        fp: &Fingerprint,
        log: &SsdLog<C>,
        payload: u64,
        guarantee_update: bool,
    ) -> Result<WriteKind> {
        loop {
            let handle = self.handle_for(fp);
            let mut segment = handle.inner.lock().expect("lock poisoned");
            if !self.is_current(fp, &handle) {
                continue;
            }

            match segment.write(fp, log, payload, guarantee_update)? {
                SegmentWrite::Inserted => {
                    self.live_keys.fetch_add(1, Ordering::Relaxed);
                    return Ok(WriteKind::Inserted);
                }
                SegmentWrite::Updated => return Ok(WriteKind::Updated),
                SegmentWrite::Full => {
                    if !C::EXPAND {
                        return Err(Error::NoSpace);
                    }
                    let (zero, one) = segment.split(log)?;
                    self.install_split(fp, segment.fp_index(), zero, one);
                    // The old segment object is unreachable now; retry
                    // against its successors.
                }
            }
        }
    }

    pub fn remove(&self, fp: &Fingerprint, log: &SsdLog<C>) -> Result<RemoveKind> {
        loop {
            let handle = self.handle_for(fp);
            let mut segment = handle.inner.lock().expect("lock poisoned");
            if !self.is_current(fp, &handle) {
                continue;
            }
            return match segment.remove(fp, log)? {
                SegmentRemove::Removed => {
                    self.live_keys.fetch_sub(1, Ordering::Relaxed);
                    Ok(RemoveKind::Removed)
                }
                SegmentRemove::NotFound => Ok(RemoveKind::NotFound),
            };
        }
    }

    /// Installs both successors of a split, doubling the directory first
    /// when the split segment was at the current depth.
    fn install_split(
        &self,
        fp: &Fingerprint,
        old_fp_index: usize,
        zero: Segment<C>,
        one: Segment<C>,
    ) {
        let mut segments = self.segments.write().expect("lock poisoned");

        let old_seg_bits = old_fp_index - 2 * LSLOT_INDEX_BITS;
        if self.depth.load(Ordering::Acquire) == old_seg_bits {
            segments.extend_from_within(..);
            self.depth.fetch_add(1, Ordering::Release);
            log::debug!("directory doubled to {} entries", segments.len());
        }

        let depth = self.depth.load(Ordering::Acquire);
        let diff = depth - old_seg_bits;
        let step = 1usize << old_seg_bits;
        let base = if old_seg_bits == 0 {
            0
        } else {
            fp.segment_bits(old_seg_bits)
        };

        let zero = Arc::new(SegmentHandle {
            inner: Mutex::new(zero),
        });
        let one = Arc::new(SegmentHandle {
            inner: Mutex::new(one),
        });

        let mut zero_idx = base;
        let mut one_idx = base + step;
        for _ in 0..1usize << (diff - 1) {
            segments[zero_idx] = Arc::clone(&zero);
            segments[one_idx] = Arc::clone(&one);
            zero_idx += 2 * step;
            one_idx += 2 * step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, NoExpandConfig};
    use test_log::test;

    fn put<C: Config>(dir: &Directory<C>, log: &SsdLog<C>, key: u64, value: u64) -> Result<WriteKind> {
        let payload = log.write(key, value)?;
        dir.write(&Fingerprint::from_key::<C>(key), log, payload, false)
    }

    #[test]
    fn directory_basic_roundtrip() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 128)?;
        let dir = Directory::<MemoryConfig>::new(0);

        for key in 0..500u64 {
            assert_eq!(WriteKind::Inserted, put(&dir, &log, key, key + 1)?);
        }
        assert_eq!(500, dir.live_keys());

        for key in 0..500u64 {
            let fp = Fingerprint::from_key::<MemoryConfig>(key);
            assert_eq!(key + 1, dir.read(&fp, &log)?.expect("present").value);
        }

        let absent = Fingerprint::from_key::<MemoryConfig>(1 << 50);
        assert_eq!(None, dir.read(&absent, &log)?);
        Ok(())
    }

    #[test]
    fn directory_grows_through_splits() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 4096)?;
        let dir = Directory::<MemoryConfig>::new(0);

        let count = 20_000u64;
        for key in 0..count {
            put(&dir, &log, key, 2 * key)?;
        }

        assert!(dir.depth() >= 2, "directory should have doubled, depth={}", dir.depth());
        assert!(dir.unique_segments() >= 4);
        assert_eq!(count as usize, dir.live_keys());
        assert_eq!(count as usize, dir.total_tenancy());

        for key in 0..count {
            let fp = Fingerprint::from_key::<MemoryConfig>(key);
            let record = dir.read(&fp, &log)?.expect("key must survive splits");
            assert_eq!(2 * key, record.value);
        }
        Ok(())
    }

    #[test]
    fn directory_shared_segments_after_doubling() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 4096)?;
        let dir = Directory::<MemoryConfig>::new(0);

        let mut key = 0u64;
        while dir.depth() == 0 {
            put(&dir, &log, key, key)?;
            key += 1;
        }

        // Right after the first doubling both new segments are installed,
        // but any segment that predates a later doubling is shared.
        let entries = 1usize << dir.depth();
        assert!(dir.unique_segments() <= entries);
        Ok(())
    }

    #[test]
    fn directory_removes_across_splits() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 4096)?;
        let dir = Directory::<MemoryConfig>::new(0);

        let count = 12_000u64;
        for key in 0..count {
            put(&dir, &log, key, key)?;
        }

        for key in (0..count).step_by(2) {
            let fp = Fingerprint::from_key::<MemoryConfig>(key);
            assert_eq!(RemoveKind::Removed, dir.remove(&fp, &log)?);
        }
        assert_eq!(count as usize / 2, dir.live_keys());
        assert_eq!(count as usize / 2, dir.total_tenancy());

        for key in 0..count {
            let fp = Fingerprint::from_key::<MemoryConfig>(key);
            let found = dir.read(&fp, &log)?;
            if key % 2 == 0 {
                assert_eq!(None, found, "key {key} was removed");
            } else {
                assert_eq!(key, found.expect("odd keys must remain").value);
            }
        }
        Ok(())
    }

    #[test]
    fn directory_no_expand_surfaces_no_space() -> crate::Result<()> {
        let log = SsdLog::<NoExpandConfig>::create("unused", 4096)?;
        let dir = Directory::<NoExpandConfig>::new(0);

        let mut filled = 0u64;
        for key in 0..100_000u64 {
            match put(&dir, &log, key, key) {
                Ok(_) => filled += 1,
                Err(Error::NoSpace) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
        assert!(filled > 3000, "got {filled}");
        assert!(filled < 100_000, "the store must eventually fill up");
        Ok(())
    }

    #[test]
    fn directory_update_does_not_grow_live_count() -> crate::Result<()> {
        let log = SsdLog::<MemoryConfig>::create("unused", 128)?;
        let dir = Directory::<MemoryConfig>::new(0);

        put(&dir, &log, 7, 1)?;
        assert_eq!(WriteKind::Updated, put(&dir, &log, 7, 2)?);
        assert_eq!(1, dir.live_keys());

        let fp = Fingerprint::from_key::<MemoryConfig>(7);
        assert_eq!(2, dir.read(&fp, &log)?.expect("present").value);
        Ok(())
    }
}
