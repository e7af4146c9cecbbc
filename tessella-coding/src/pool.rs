// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `pool` module provides the shared worker pool that executes block encoding jobs,
//! together with the failure latch that carries the first worker error back to the
//! caller.

use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use tessella_core::errors::{Result, TessellaError};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Stores the first failure observed by any worker. Subsequent failures are logged and
/// discarded; the surviving error is surfaced by `Encoder::finish`.
#[derive(Default)]
pub struct FailureLatch {
    slot: Mutex<Option<TessellaError>>,
}

impl FailureLatch {
    pub fn new() -> Self {
        FailureLatch { slot: Mutex::new(None) }
    }

    pub fn record(&self, err: TessellaError) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        else {
            debug!("suppressing secondary failure: {}", err);
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Removes and returns the captured failure, if any.
    pub fn take(&self) -> Option<TessellaError> {
        self.slot.lock().unwrap().take()
    }
}

/// A fixed pool of worker threads draining a shared job queue.
///
/// Jobs are opaque closures; scheduling order follows submission order but jobs run
/// concurrently, so completion order is unconstrained. Dropping the pool closes the
/// queue and joins every worker.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `num_threads` workers. Fails with `ThreadAttachFailure` when the operating
    /// system refuses to create a thread.
    pub fn new(num_threads: usize) -> Result<Self> {
        assert!(num_threads > 0);
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(num_threads);
        for n in 0..num_threads {
            let rx: Receiver<Job> = rx.clone();
            let builder = thread::Builder::new().name(format!("tessella-worker-{}", n));
            let handle = builder
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|_| TessellaError::ThreadAttachFailure)?;
            workers.push(handle);
        }
        Ok(WorkerPool { tx: Some(tx), workers })
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a job for execution. Jobs submitted after the pool begins shutting down
    /// are dropped silently.
    pub fn submit(&self, job: Job) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets each worker drain the queue and exit.
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn verify_jobs_run() {
        let pool = WorkerPool::new(3).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let count = Arc::clone(&count);
            pool.submit(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(pool); // joins workers after the queue drains
        assert_eq!(count.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn verify_failure_latch_keeps_first() {
        let latch = FailureLatch::new();
        assert!(!latch.is_set());
        latch.record(TessellaError::InsufficientPrecision);
        latch.record(TessellaError::OutOfMemory);
        assert!(matches!(latch.take(), Some(TessellaError::InsufficientPrecision)));
        assert!(latch.take().is_none());
    }
}
