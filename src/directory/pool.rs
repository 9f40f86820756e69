// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Optional worker threads for dispatched store operations.
//!
//! Each worker owns one MPSC queue; the store enqueues by segment index
//! modulo worker count, so operations on one segment never race across
//! workers. Results come back through one-shot channels wrapped in
//! [`Task`]. Dispatched operations are not cancellable; dropping a task
//! just discards its result.

use std::sync::mpsc;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the result of a dispatched operation.
pub struct Task<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> Task<T> {
    /// Blocks until the operation completes.
    pub fn wait(self) -> T {
        self.receiver.recv().expect("worker dropped the task")
    }
}

pub(crate) fn task_pair<T>() -> (mpsc::Sender<T>, Task<T>) {
    let (sender, receiver) = mpsc::channel();
    (sender, Task { receiver })
}

/// Fixed pool of worker threads, one queue per worker.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Job>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        debug_assert!(workers > 0);

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (sender, receiver) = mpsc::channel::<Job>();
            senders.push(sender);
            let handle = std::thread::Builder::new()
                .name(format!("skarn-worker-{id}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        Self { senders, handles }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    pub(crate) fn dispatch(&self, worker: usize, job: Job) {
        let _ = self.senders[worker % self.senders.len()].send(job);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn pool_runs_jobs_and_returns_results() {
        let pool = WorkerPool::new(4);

        let tasks: Vec<_> = (0..32u64)
            .map(|i| {
                let (sender, task) = task_pair();
                pool.dispatch(i as usize, Box::new(move || {
                    let _ = sender.send(i * i);
                }));
                task
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!((i * i) as u64, task.wait());
        }
    }

    #[test]
    fn pool_shuts_down_cleanly() {
        let pool = WorkerPool::new(2);
        let (sender, task) = task_pair();
        pool.dispatch(0, Box::new(move || {
            let _ = sender.send(1);
        }));
        assert_eq!(1, task.wait());
        drop(pool);
    }
}
