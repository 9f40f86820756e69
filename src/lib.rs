// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A persistent, hash-indexed key/value store.
//!
//! `skarn` keeps its in-memory metadata extremely compact: a growable
//! directory routes a key's 128-bit fingerprint to a segment, a block and
//! a logical slot ("l-slot"); the set of fingerprints sharing one l-slot
//! is captured by a succinct trie encoding; and each block carries only a
//! short payload pointer per key into an append-only, page-aligned log
//! where the records live.
//!
//! ```
//! # fn main() -> skarn::Result<()> {
//! use skarn::{KvStore, MemoryConfig, RemoveKind};
//!
//! let store = KvStore::<MemoryConfig>::create("unused", 128, 0)?;
//!
//! store.put(1, 100)?;
//! assert_eq!(Some(100), store.get(1)?);
//! assert_eq!(RemoveKind::Removed, store.remove(1)?);
//! assert_eq!(None, store.get(1)?);
//! # Ok(())
//! # }
//! ```
//!
//! Blocks that overflow spill whole l-slots into a small ring of extension
//! blocks; segments that cannot extend split in two, doubling the affected
//! slice of the directory in place. Reads that reach the log can be
//! short-circuited by per-slot reserve bits and served from a clock-evicted
//! buffer pool.

#![doc(html_root_url = "https://docs.rs/skarn/0.1.0")]
#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

mod bitvec;
mod block;
mod buffer_pool;
mod coding;
mod config;
mod directory;
mod error;
mod extension;
mod fingerprint;
mod payload;
mod segment;
mod ssd_log;
mod store;
mod trie;

pub use buffer_pool::BufferPool;
pub use coding::Record;
pub use config::{
    CachedConfig, Config, DefaultConfig, DhtConfig, MemoryConfig, MemoryReserveConfig,
    NoExpandConfig, ReadOffStrategy, SlotWord,
};
pub use directory::pool::Task;
pub use directory::{Directory, RemoveKind, WriteKind};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use ssd_log::{SsdLog, ENTRIES_PER_PAGE, PAGE_SIZE};
pub use store::KvStore;
