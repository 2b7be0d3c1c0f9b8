//! Fixed set of upgrade worker threads behind a bounded queue.
//!
//! Admission is counted up front: a caller first takes a [`Reservation`],
//! which fails fast once `workers + queue_depth` jobs are outstanding, and
//! only then writes anything durable.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
#[error("worker pool has shut down")]
pub struct PoolClosed;

pub struct WorkerPool {
    tx: SyncSender<Job>,
    outstanding: Arc<AtomicUsize>,
    capacity: usize,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        let capacity = workers + queue_depth;
        let (tx, rx) = mpsc::sync_channel::<Job>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        for idx in 0..workers {
            let rx = Arc::clone(&rx);
            let spawned = thread::Builder::new()
                .name(format!("upgrade-worker-{idx}"))
                .spawn(move || worker_loop(rx));
            if let Err(err) = spawned {
                tracing::error!(worker = idx, error = %err, "worker-spawn-failed");
            }
        }

        Self {
            tx,
            outstanding: Arc::new(AtomicUsize::new(0)),
            capacity,
            workers,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Jobs admitted and not yet finished (running, queued or reserved).
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn try_reserve(&self) -> Option<Reservation> {
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.capacity).then_some(current + 1)
            })
            .ok()?;
        Some(Reservation {
            slot: Some(Slot(Arc::clone(&self.outstanding))),
            tx: self.tx.clone(),
        })
    }
}

/// One admitted slot. Dropping it without submitting gives the slot back.
pub struct Reservation {
    slot: Option<Slot>,
    tx: SyncSender<Job>,
}

impl Reservation {
    pub fn submit<F>(mut self, job: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(slot) = self.slot.take() else {
            return Err(PoolClosed);
        };
        // The slot travels with the job and is released when the job ends,
        // panic included.
        let wrapped: Job = Box::new(move || {
            let _slot = slot;
            job();
        });
        // Admission already bounded the number of jobs to the channel's
        // capacity, so this never blocks.
        self.tx.send(wrapped).map_err(|_| PoolClosed)
    }
}

struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let Ok(guard) = rx.lock() else {
                return;
            };
            match guard.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(
                worker = thread::current().name().unwrap_or("upgrade-worker"),
                "job panicked"
            );
        }
    }
}
