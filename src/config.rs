// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compile-time store configuration.
//!
//! All tuning knobs are enumerated as associated constants on [`Config`];
//! there are no dynamic parameters. A configuration is a zero-sized type
//! implementing the trait, so every knob is resolved at monomorphization
//! time, the way the original set of presets is closed.

/// Number of metadata bits per block.
pub const BLOCK_BITS: usize = 256;

/// Number of l-slots per block (and blocks per segment).
pub const LSLOT_COUNT: usize = 64;

/// Bits of the fingerprint consumed by one 6-bit selection field.
pub const LSLOT_INDEX_BITS: usize = 6;

/// Backing word of one payload slot.
///
/// The low bits carry the log pointer; when reserve bits are enabled, the
/// top [`Config::NUMBER_EXTRA_BITS`] bits carry the unary age field plus
/// extra fingerprint bits.
pub trait SlotWord:
    Copy + Default + Eq + std::fmt::Debug + Send + Sync + 'static
{
    const BITS: u32;

    fn from_u64(value: u64) -> Self;
    fn to_u64(self) -> u64;
}

macro_rules! impl_slot_word {
    ($($t:ty),*) => {
        $(impl SlotWord for $t {
            const BITS: u32 = <$t>::BITS;

            fn from_u64(value: u64) -> Self {
                value as $t
            }

            fn to_u64(self) -> u64 {
                self as u64
            }
        })*
    };
}

impl_slot_word!(u8, u16, u32, u64);

/// How a block resolves a fingerprint to an offset within an l-slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadOffStrategy {
    /// Trie walk with a tenancy-2 fast path.
    Optimised,

    /// Trie walk without the memoised-signature shortcut.
    NoHashtable,

    /// Pure recursive walk, no fast paths.
    NoTen2Fastpath,

    /// Distributed-hash-table mode: no trie encoding, candidates are
    /// scanned against the log.
    Dht,
}

/// Static configuration of a store instance.
pub trait Config: Send + Sync + 'static {
    /// Payload slot width.
    type Slot: SlotWord;

    /// Number of extension blocks per segment (the ring size K).
    const EXTENSION_BLOCK_COUNT: usize = 4;

    /// Metadata bits per entry used to size the payload list.
    const BITS_PER_ENTRY: usize = 4;

    /// Extra payload slots that delay the need for displacement.
    const SAFETY_PAYLOADS: usize = 4;

    /// Reserve bits per payload slot (R); `<= 1` disables the feature.
    const NUMBER_EXTRA_BITS: u32 = 8;

    /// Minimum free bits in a block before displacement is triggered.
    const EXTENSION_THRESHOLD: usize = 1;

    /// Offset resolution strategy for reads.
    const READ_OFF_STRATEGY: ReadOffStrategy = ReadOffStrategy::Optimised;

    /// DHT write layout (one payload slot per fingerprint, no trie bits).
    const DHT_MODE: bool = false;

    /// Whether the directory may double. When disabled, a full segment
    /// surfaces [`crate::Error::NoSpace`].
    const EXPAND: bool = true;

    /// Hash keys with xxh3. When disabled, the fingerprint repeats the raw
    /// key bits; only useful for deterministic tests.
    const USE_XXHASH: bool = true;

    /// Keep the log in RAM instead of a file.
    const IN_MEMORY: bool = false;

    /// Buffer pool capacity in entries; zero disables the pool.
    const BUFFER_POOL_CAP: usize = 0;

    /// Load factor that triggers eviction.
    const MAX_LF: f32 = 0.0;

    /// Number of buffer pool slots covered by one region lock.
    const LOCK_LENGTH: usize = 100;

    /// Sweep a whole lock region per eviction pass instead of single steps.
    const BATCH_EVICTION: bool = false;

    /// Populate the buffer pool on log reads.
    const BP_PUT_ON_READ: bool = false;

    /// Populate the buffer pool on log writes.
    const BP_PUT_ON_WRITE: bool = false;
}

/// Payload list capacity for a configuration.
#[must_use]
pub const fn payload_capacity<C: Config>() -> usize {
    BLOCK_BITS / C::BITS_PER_ENTRY + C::SAFETY_PAYLOADS
}

/// Default configuration: file-backed log, reserve bits enabled.
pub struct DefaultConfig;

impl Config for DefaultConfig {
    type Slot = u32;
}

/// In-memory log, reserve bits disabled, no slack payload slots.
pub struct MemoryConfig;

impl Config for MemoryConfig {
    type Slot = u32;

    const SAFETY_PAYLOADS: usize = 0;
    const NUMBER_EXTRA_BITS: u32 = 1;
    const IN_MEMORY: bool = true;
}

/// In-memory log with a narrow reserve-bit filter.
pub struct MemoryReserveConfig;

impl Config for MemoryReserveConfig {
    type Slot = u32;

    const SAFETY_PAYLOADS: usize = 0;
    const NUMBER_EXTRA_BITS: u32 = 3;
    const IN_MEMORY: bool = true;
}

/// In-memory log with directory growth disabled.
pub struct NoExpandConfig;

impl Config for NoExpandConfig {
    type Slot = u32;

    const SAFETY_PAYLOADS: usize = 0;
    const NUMBER_EXTRA_BITS: u32 = 1;
    const IN_MEMORY: bool = true;
    const EXPAND: bool = false;
}

/// Distributed-hash-table mode: trie encoding off, candidate scan on reads.
pub struct DhtConfig;

impl Config for DhtConfig {
    type Slot = u32;

    const SAFETY_PAYLOADS: usize = 0;
    const NUMBER_EXTRA_BITS: u32 = 1;
    const IN_MEMORY: bool = true;
    const READ_OFF_STRATEGY: ReadOffStrategy = ReadOffStrategy::Dht;
    const DHT_MODE: bool = true;
    const EXPAND: bool = false;
}

/// In-memory log with the buffer pool enabled.
pub struct CachedConfig;

impl Config for CachedConfig {
    type Slot = u32;

    const SAFETY_PAYLOADS: usize = 0;
    const NUMBER_EXTRA_BITS: u32 = 1;
    const IN_MEMORY: bool = true;
    const BUFFER_POOL_CAP: usize = 1 << 16;
    const MAX_LF: f32 = 0.5;
    const BP_PUT_ON_READ: bool = true;
    const BP_PUT_ON_WRITE: bool = true;
}
