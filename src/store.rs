// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The public key/value surface.
//!
//! A store is a [`Directory`] over an [`SsdLog`]: `put` appends the record
//! to the log first, so the payload address is known before the in-core
//! insertion; `get` routes through the directory and re-checks the log
//! record; `remove` reports whether the key existed.
//!
//! Opened with workers, operations can also be dispatched to a fixed
//! thread pool, one MPSC queue per worker, keyed by segment index. The
//! returned [`Task`]s block on `wait`.

use crate::config::Config;
use crate::directory::pool::{task_pair, Task, WorkerPool};
use crate::directory::{Directory, RemoveKind, WriteKind};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::ssd_log::SsdLog;
use std::path::Path;
use std::sync::Arc;

/// A persistent hash-indexed key/value store.
pub struct KvStore<C: Config> {
    directory: Arc<Directory<C>>,
    log: Arc<SsdLog<C>>,
    workers: Option<WorkerPool>,
}

impl<C: Config> KvStore<C> {
    /// Opens a store with a log of `log_pages` pages at `path` and an
    /// initial directory depth of `depth`.
    pub fn create<P: AsRef<Path>>(path: P, log_pages: usize, depth: usize) -> Result<Self> {
        Ok(Self {
            directory: Arc::new(Directory::new(depth)),
            log: Arc::new(SsdLog::create(path, log_pages)?),
            workers: None,
        })
    }

    /// Like [`KvStore::create`], with a worker pool for dispatched
    /// operations.
    pub fn create_with_workers<P: AsRef<Path>>(
        path: P,
        log_pages: usize,
        depth: usize,
        workers: usize,
    ) -> Result<Self> {
        let mut store = Self::create(path, log_pages, depth)?;
        store.workers = Some(WorkerPool::new(workers));
        Ok(store)
    }

    /// Inserts or overwrites a key.
    pub fn put(&self, key: u64, value: u64) -> Result<WriteKind> {
        let payload = self.log.write(key, value)?;
        let fp = Fingerprint::from_key::<C>(key);
        self.directory.write(&fp, &self.log, payload, false)
    }

    /// Overwrites a key known to be present, skipping block space checks.
    pub fn update(&self, key: u64, value: u64) -> Result<WriteKind> {
        let payload = self.log.write(key, value)?;
        let fp = Fingerprint::from_key::<C>(key);
        self.directory.write(&fp, &self.log, payload, true)
    }

    /// Looks up a key.
    pub fn get(&self, key: u64) -> Result<Option<u64>> {
        let fp = Fingerprint::from_key::<C>(key);
        Ok(self.directory.read(&fp, &self.log)?.map(|r| r.value))
    }

    /// Removes a key, reporting whether it was present.
    pub fn remove(&self, key: u64) -> Result<RemoveKind> {
        let fp = Fingerprint::from_key::<C>(key);
        self.directory.remove(&fp, &self.log)
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.directory.live_keys()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn directory(&self) -> &Directory<C> {
        &self.directory
    }

    #[must_use]
    pub fn log(&self) -> &SsdLog<C> {
        &self.log
    }

    fn pool(&self) -> &WorkerPool {
        self.workers
            .as_ref()
            .expect("store was opened without workers")
    }

    fn worker_for(&self, fp: &Fingerprint) -> usize {
        fp.segment_bits(self.directory.depth()) % self.pool().worker_count()
    }

    /// Dispatches a put to the worker pool.
    #[must_use]
    pub fn put_task(&self, key: u64, value: u64) -> Task<Result<WriteKind>> {
        let fp = Fingerprint::from_key::<C>(key);
        let worker = self.worker_for(&fp);
        let directory = Arc::clone(&self.directory);
        let log = Arc::clone(&self.log);
        let (sender, task) = task_pair();
        self.pool().dispatch(
            worker,
            Box::new(move || {
                let result = log
                    .write(key, value)
                    .and_then(|payload| directory.write(&fp, &log, payload, false));
                let _ = sender.send(result);
            }),
        );
        task
    }

    /// Dispatches a get to the worker pool.
    #[must_use]
    pub fn get_task(&self, key: u64) -> Task<Result<Option<u64>>> {
        let fp = Fingerprint::from_key::<C>(key);
        let worker = self.worker_for(&fp);
        let directory = Arc::clone(&self.directory);
        let log = Arc::clone(&self.log);
        let (sender, task) = task_pair();
        self.pool().dispatch(
            worker,
            Box::new(move || {
                let result = directory.read(&fp, &log).map(|r| r.map(|record| record.value));
                let _ = sender.send(result);
            }),
        );
        task
    }

    /// Dispatches a remove to the worker pool.
    #[must_use]
    pub fn remove_task(&self, key: u64) -> Task<Result<RemoveKind>> {
        let fp = Fingerprint::from_key::<C>(key);
        let worker = self.worker_for(&fp);
        let directory = Arc::clone(&self.directory);
        let log = Arc::clone(&self.log);
        let (sender, task) = task_pair();
        self.pool().dispatch(
            worker,
            Box::new(move || {
                let _ = sender.send(directory.remove(&fp, &log));
            }),
        );
        task
    }
}
