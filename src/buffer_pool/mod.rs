// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cache of recent log entries, keyed by payload address.
//!
//! A linear-probing hash table whose probe order is the sorted hash order
//! of keys, so a lookup can stop at the first entry with a strictly
//! greater hash. The table is partitioned into lock regions of
//! [`Config::LOCK_LENGTH`] slots; an operation locks the region covering
//! its initial probe position plus the right neighbour, which bounds every
//! probe chain. Eviction is clock with per-entry reference bits, either
//! single-step or sweeping one whole region per pass.

use crate::config::Config;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use xxhash_rust::xxh3::xxh3_64;

#[derive(Copy, Clone, Default)]
struct Slot {
    address: u64,
    key: u64,
    value: u64,
    occupied: bool,
    reference: bool,
    valid: bool,
}

/// Two locked regions giving a window into the table.
///
/// The regions need not be adjacent (the clock hand wraps); indexing is by
/// absolute slot position.
struct Window<'a> {
    first_base: usize,
    first: MutexGuard<'a, Vec<Slot>>,
    second_base: usize,
    second: Option<MutexGuard<'a, Vec<Slot>>>,
}

impl Window<'_> {
    fn slot(&self, index: usize) -> &Slot {
        if index >= self.first_base && index < self.first_base + self.first.len() {
            &self.first[index - self.first_base]
        } else {
            let second = self.second.as_ref().expect("index outside locked window");
            &second[index - self.second_base]
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot {
        if index >= self.first_base && index < self.first_base + self.first.len() {
            &mut self.first[index - self.first_base]
        } else {
            let second = self.second.as_mut().expect("index outside locked window");
            &mut second[index - self.second_base]
        }
    }

}

/// Clock-evicted, sorted-probe cache of log entries.
pub struct BufferPool<C: Config> {
    regions: Vec<Mutex<Vec<Slot>>>,
    capacity: usize,
    size: AtomicUsize,
    clock_hand: Mutex<usize>,
    pub hit_count: AtomicUsize,
    pub query_count: AtomicUsize,
    _config: PhantomData<C>,
}

impl<C: Config> BufferPool<C> {
    #[must_use]
    pub fn new() -> Self {
        let capacity = C::BUFFER_POOL_CAP;
        let region_count = if capacity == 0 {
            0
        } else {
            capacity.div_ceil(C::LOCK_LENGTH) + 1
        };

        Self {
            regions: (0..region_count)
                .map(|_| Mutex::new(vec![Slot::default(); C::LOCK_LENGTH]))
                .collect(),
            capacity,
            size: AtomicUsize::new(0),
            clock_hand: Mutex::new(0),
            hit_count: AtomicUsize::new(0),
            query_count: AtomicUsize::new(0),
            _config: PhantomData,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table_len(&self) -> usize {
        self.regions.len() * C::LOCK_LENGTH
    }

    fn hash(address: u64) -> u64 {
        if C::USE_XXHASH {
            xxh3_64(&address.to_le_bytes())
        } else {
            address
        }
    }

    /// log2 of the capacity, used for both the initial index and the load
    /// factor denominator.
    fn k(&self) -> u32 {
        debug_assert!(self.capacity > 0);
        usize::BITS - 1 - self.capacity.leading_zeros()
    }

    fn initial_index(&self, hash: u64) -> usize {
        (hash >> (64 - self.k())) as usize
    }

    fn load_factor(&self) -> f32 {
        self.len() as f32 / (1usize << self.k()) as f32
    }

    /// Locks the region covering `index` and its right neighbour.
    fn window(&self, region: usize) -> Window<'_> {
        let first = self.regions[region].lock().expect("lock poisoned");
        let second = self.regions.get(region + 1).map(|r| r.lock().expect("lock poisoned"));
        Window {
            first_base: region * C::LOCK_LENGTH,
            first,
            second_base: (region + 1) * C::LOCK_LENGTH,
            second,
        }
    }

    /// Locks two regions in index order.
    fn window_pair(&self, a: usize, b: usize) -> Window<'_> {
        debug_assert!(a != b);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let first = self.regions[lo].lock().expect("lock poisoned");
        let second = self.regions[hi].lock().expect("lock poisoned");
        Window {
            first_base: lo * C::LOCK_LENGTH,
            first,
            second_base: hi * C::LOCK_LENGTH,
            second: Some(second),
        }
    }

    /// Inserts or refreshes an entry. Returns false when the pool is
    /// disabled or the probe window is exhausted.
    pub fn put(&self, address: u64, value: u64, key: u64) -> bool {
        if C::BUFFER_POOL_CAP == 0 {
            return false;
        }

        if self.load_factor() > C::MAX_LF {
            let evicted = if C::BATCH_EVICTION {
                self.batch_evict()
            } else {
                self.evict()
            };
            if !evicted {
                return false;
            }
        }

        let hash = Self::hash(address);
        let start = self.initial_index(hash);
        let region = start / C::LOCK_LENGTH;
        let mut window = self.window(region);

        let bound = ((region + 2) * C::LOCK_LENGTH).min(self.table_len());
        let mut current = start;
        while current < bound {
            let slot = *window.slot(current);
            if !slot.occupied {
                *window.slot_mut(current) = Slot {
                    address,
                    key,
                    value,
                    occupied: true,
                    reference: true,
                    valid: true,
                };
                self.size.fetch_add(1, Ordering::Relaxed);
                return true;
            }

            let slot_hash = Self::hash(slot.address);
            match slot_hash.cmp(&hash) {
                std::cmp::Ordering::Greater => {
                    // Keep the probe chain sorted: open this position.
                    if !Self::shift_right(&mut window, current, bound) {
                        return false;
                    }
                    *window.slot_mut(current) = Slot {
                        address,
                        key,
                        value,
                        occupied: true,
                        reference: true,
                        valid: true,
                    };
                    self.size.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                std::cmp::Ordering::Equal => {
                    let slot = window.slot_mut(current);
                    slot.value = value;
                    slot.key = key;
                    slot.reference = true;
                    slot.valid = true;
                    return true;
                }
                std::cmp::Ordering::Less => current += 1,
            }
        }
        false
    }

    /// Looks up an entry, setting its reference bit.
    #[must_use]
    pub fn get(&self, address: u64) -> Option<(u64, u64)> {
        if C::BUFFER_POOL_CAP == 0 {
            return None;
        }
        self.query_count.fetch_add(1, Ordering::Relaxed);

        let hash = Self::hash(address);
        let start = self.initial_index(hash);
        let region = start / C::LOCK_LENGTH;
        let mut window = self.window(region);

        let bound = ((region + 2) * C::LOCK_LENGTH).min(self.table_len());
        let mut current = start;
        while current < bound {
            let slot = *window.slot(current);
            if !slot.occupied {
                return None;
            }
            let slot_hash = Self::hash(slot.address);
            if slot_hash == hash && slot.valid {
                window.slot_mut(current).reference = true;
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                return Some((slot.key, slot.value));
            }
            if slot_hash > hash {
                return None;
            }
            current += 1;
        }
        None
    }

    /// Marks an entry dead so the next clock pass reclaims it.
    pub fn invalidate(&self, address: u64) -> bool {
        if C::BUFFER_POOL_CAP == 0 {
            return false;
        }

        let hash = Self::hash(address);
        let start = self.initial_index(hash);
        let region = start / C::LOCK_LENGTH;
        let mut window = self.window(region);

        let bound = ((region + 2) * C::LOCK_LENGTH).min(self.table_len());
        let mut current = start;
        while current < bound {
            let slot = *window.slot(current);
            if !slot.occupied {
                return false;
            }
            let slot_hash = Self::hash(slot.address);
            if slot_hash == hash && slot.valid {
                window.slot_mut(current).valid = false;
                return true;
            }
            if slot_hash > hash {
                return false;
            }
            current += 1;
        }
        false
    }

    /// Advances the clock hand until one entry is evicted: reference bits
    /// are cleared in passing and the first non-referenced (or dead) entry
    /// is removed.
    fn evict(&self) -> bool {
        let mut hand = self.clock_hand.lock().expect("lock poisoned");

        let region = *hand / C::LOCK_LENGTH;
        let next = if region + 1 >= self.regions.len() {
            0
        } else {
            region + 1
        };
        let mut window = if region == next {
            self.window(region)
        } else {
            self.window_pair(region, next)
        };

        let mut probes = 0usize;
        loop {
            if !window.contains_index(*hand, C::LOCK_LENGTH) {
                // Hand left the locked window without finding a victim.
                return false;
            }
            probes += 1;
            let slot = *window.slot(*hand);
            if slot.occupied {
                if !slot.reference || !slot.valid || probes > C::LOCK_LENGTH {
                    let bound = window.shift_bound(*hand, C::LOCK_LENGTH);
                    if !Self::shift_left_sorted(self, &mut window, *hand, bound) {
                        return false;
                    }
                    self.size.fetch_sub(1, Ordering::Relaxed);
                    *hand = (*hand + 1) % self.table_len();
                    return true;
                }
                window.slot_mut(*hand).reference = false;
            }
            *hand = (*hand + 1) % self.table_len();
        }
    }

    /// Sweeps one whole lock region: clears reference bits and evicts every
    /// stale entry in a single pass.
    fn batch_evict(&self) -> bool {
        let mut hand = self.clock_hand.lock().expect("lock poisoned");

        let region = *hand / C::LOCK_LENGTH;
        let next = if region + 1 >= self.regions.len() {
            0
        } else {
            region + 1
        };
        let mut window = if region == next {
            self.window(region)
        } else {
            self.window_pair(region, next)
        };

        let mut evicted = false;
        let start = region * C::LOCK_LENGTH;
        let end = ((region + 1) * C::LOCK_LENGTH).min(self.table_len());
        for i in start..end {
            let slot = *window.slot(i);
            if slot.occupied && (!slot.reference || !slot.valid) {
                let bound = window.shift_bound(i, C::LOCK_LENGTH);
                if Self::shift_left_sorted(self, &mut window, i, bound) {
                    self.size.fetch_sub(1, Ordering::Relaxed);
                    evicted = true;
                }
            } else if slot.occupied {
                window.slot_mut(i).reference = false;
            }
        }

        log::trace!(
            "buffer pool batch eviction over [{start}, {end}), evicted={evicted}",
        );

        *hand = (*hand + C::LOCK_LENGTH) % self.table_len();
        if *hand < C::LOCK_LENGTH {
            *hand = 0;
        }
        evicted
    }

    /// Opens a slot at `index` by moving the chain right; fails when the
    /// chain reaches `bound`.
    fn shift_right(window: &mut Window<'_>, index: usize, bound: usize) -> bool {
        let mut last = index;
        while last + 1 < bound {
            last += 1;
            if !window.slot(last).occupied {
                break;
            }
        }
        if last + 1 == bound && window.slot(last).occupied {
            return false;
        }

        while last != index {
            *window.slot_mut(last) = *window.slot(last - 1);
            last -= 1;
        }
        true
    }

    /// Removes the entry at `index`, pulling the rest of its probe chain
    /// left so the sorted-probe invariant keeps holding. Entries already at
    /// their initial position stop the pull.
    fn shift_left_sorted(&self, window: &mut Window<'_>, index: usize, bound: usize) -> bool {
        // First pass: make sure the chain terminates inside the window.
        {
            let mut current = index;
            loop {
                if current + 1 >= bound {
                    return false;
                }
                let next_slot = *window.slot(current + 1);
                if !next_slot.occupied
                    || current + 1 == self.initial_index(Self::hash(next_slot.address))
                {
                    break;
                }
                current += 1;
            }
        }

        let mut current = index;
        loop {
            let next_slot = *window.slot(current + 1);
            if !next_slot.occupied
                || current + 1 == self.initial_index(Self::hash(next_slot.address))
            {
                *window.slot_mut(current) = Slot::default();
                return true;
            }
            *window.slot_mut(current) = next_slot;
            current += 1;
        }
    }
}

impl<C: Config> Default for BufferPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl Window<'_> {
    /// Whether `index` lies within one of the locked regions.
    fn contains_index(&self, index: usize, lock_length: usize) -> bool {
        (index >= self.first_base && index < self.first_base + lock_length)
            || (self.second.is_some()
                && index >= self.second_base
                && index < self.second_base + lock_length)
    }

    /// Upper probe bound for a shift starting at `index`: the end of the
    /// locked span containing it, extended over the neighbour when the two
    /// regions are adjacent.
    fn shift_bound(&self, index: usize, lock_length: usize) -> usize {
        if index >= self.first_base && index < self.first_base + lock_length {
            if self.second.is_some() && self.second_base == self.first_base + lock_length {
                self.second_base + lock_length
            } else {
                self.first_base + lock_length
            }
        } else {
            self.second_base + lock_length
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use test_log::test;

    /// Identity-hashed pool so probe positions are predictable.
    struct SmallPool;

    impl Config for SmallPool {
        type Slot = u32;

        const USE_XXHASH: bool = false;
        const BUFFER_POOL_CAP: usize = 64;
        const MAX_LF: f32 = 0.5;
        const LOCK_LENGTH: usize = 64;
        const IN_MEMORY: bool = true;
    }

    struct BatchPool;

    impl Config for BatchPool {
        type Slot = u32;

        const USE_XXHASH: bool = false;
        const BUFFER_POOL_CAP: usize = 64;
        const MAX_LF: f32 = 0.5;
        const LOCK_LENGTH: usize = 16;
        const BATCH_EVICTION: bool = true;
        const IN_MEMORY: bool = true;
    }

    struct DisabledPool;

    impl Config for DisabledPool {
        type Slot = u32;

        const BUFFER_POOL_CAP: usize = 0;
        const IN_MEMORY: bool = true;
    }

    /// Address whose initial probe index is `idx` under identity hashing
    /// (k = 6 for capacity 64).
    fn addr_at(idx: u64) -> u64 {
        idx << (64 - 6)
    }

    #[test]
    fn pool_put_get() {
        let pool = BufferPool::<SmallPool>::new();

        assert!(pool.put(addr_at(3), 30, 3));
        assert!(pool.put(addr_at(7), 70, 7));

        assert_eq!(Some((3, 30)), pool.get(addr_at(3)));
        assert_eq!(Some((7, 70)), pool.get(addr_at(7)));
        assert_eq!(None, pool.get(addr_at(9)));
    }

    #[test]
    fn pool_update_in_place() {
        let pool = BufferPool::<SmallPool>::new();
        assert!(pool.put(addr_at(3), 30, 3));
        assert!(pool.put(addr_at(3), 31, 3));
        assert_eq!(1, pool.len());
        assert_eq!(Some((3, 31)), pool.get(addr_at(3)));
    }

    #[test]
    fn pool_sorted_probe_disproof() {
        let pool = BufferPool::<SmallPool>::new();

        // Three entries colliding at index 5; probe order follows hash order.
        let base = addr_at(5);
        assert!(pool.put(base, 1, 1));
        assert!(pool.put(base + 2, 2, 2));
        assert!(pool.put(base + 4, 3, 3));

        // base + 1 would sort between the first two: its absence is proven
        // at the second slot without walking the chain.
        assert_eq!(None, pool.get(base + 1));
        assert_eq!(Some((2, 2)), pool.get(base + 2));
    }

    #[test]
    fn pool_insert_keeps_hash_order() {
        let pool = BufferPool::<SmallPool>::new();

        let base = addr_at(5);
        assert!(pool.put(base + 4, 3, 3));
        assert!(pool.put(base, 1, 1));
        assert!(pool.put(base + 2, 2, 2));

        assert_eq!(Some((1, 1)), pool.get(base));
        assert_eq!(Some((2, 2)), pool.get(base + 2));
        assert_eq!(Some((3, 3)), pool.get(base + 4));
    }

    #[test]
    fn pool_invalidate() {
        let pool = BufferPool::<SmallPool>::new();
        assert!(pool.put(addr_at(3), 30, 3));
        assert!(pool.invalidate(addr_at(3)));
        assert_eq!(None, pool.get(addr_at(3)));
        assert!(!pool.invalidate(addr_at(9)));
    }

    #[test]
    fn pool_clock_evicts_untouched_entry() {
        // Over MAX_LF, the clock hand clears reference bits on its first
        // pass and evicts the first entry it finds unreferenced.
        let pool = BufferPool::<SmallPool>::new();

        for i in 0..33u64 {
            assert!(pool.put(addr_at(i), i, i));
        }

        // First eviction: every reference bit is cleared in passing and the
        // entry at the hand (index 0) goes.
        assert!(pool.put(addr_at(40), 40, 40));
        assert_eq!(None, pool.get(addr_at(0)));

        // Touch everything except entry 1.
        for i in 2..33u64 {
            assert_eq!(Some((i, i)), pool.get(addr_at(i)));
        }
        assert_eq!(Some((40, 40)), pool.get(addr_at(40)));

        // The next eviction skips all touched entries and takes entry 1.
        assert!(pool.put(addr_at(41), 41, 41));
        assert_eq!(None, pool.get(addr_at(1)));
        for i in 2..33u64 {
            assert_eq!(Some((i, i)), pool.get(addr_at(i)), "entry {i} must survive");
        }
        assert_eq!(Some((41, 41)), pool.get(addr_at(41)));
    }

    #[test]
    fn pool_batch_eviction_sweeps_region() {
        let pool = BufferPool::<BatchPool>::new();

        for i in 0..33u64 {
            assert!(pool.put(addr_at(i), i, i));
        }

        // Each failed put sweeps one lock region, clearing reference bits;
        // once the hand wraps, the first region is reclaimed wholesale.
        let mut tries = 0;
        while !pool.put(addr_at(40), 40, 40) {
            tries += 1;
            assert!(tries < 10, "batch eviction should make progress");
        }

        for i in 0..16u64 {
            assert_eq!(None, pool.get(addr_at(i)), "entry {i} should be evicted");
        }
        for i in 16..33u64 {
            assert_eq!(Some((i, i)), pool.get(addr_at(i)), "entry {i} must survive");
        }
        assert_eq!(Some((40, 40)), pool.get(addr_at(40)));
    }

    #[test]
    fn pool_disabled_is_inert() {
        let pool = BufferPool::<DisabledPool>::new();
        assert!(!pool.put(1, 2, 3));
        assert_eq!(None, pool.get(1));
    }
}
