//! Bounded worker pool for inbound calls.
//!
//! Admission goes through a fair semaphore, so calls beyond the capacity
//! queue in FIFO order instead of being rejected.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::types::{Error, Result};

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
}

#[derive(Debug)]
pub struct WorkerPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
    closed: Mutex<bool>,
}

/// Held for the duration of a call (the whole stream for streaming calls).
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        if self.counters.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct QueuedGuard<'a>(&'a Counters);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(Counters::default()),
            idle: Arc::new(Notify::new()),
            closed: Mutex::new(false),
        }
    }

    /// Wait for a free worker slot.
    pub async fn acquire(&self) -> Result<WorkerPermit> {
        self.counters.queued.fetch_add(1, Ordering::AcqRel);
        let queued = QueuedGuard(&self.counters);
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::shutting_down("worker pool is closed"))?;
        drop(queued);
        self.counters.active.fetch_add(1, Ordering::AcqRel);
        Ok(WorkerPermit {
            _permit: permit,
            counters: self.counters.clone(),
            idle: self.idle.clone(),
        })
    }

    /// Wait until no call is running, for at most `grace`.
    /// Returns `false` if calls were still running when the grace expired.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait_idle = async {
            loop {
                let notified = self.idle.notified();
                if self.counters.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait_idle).await.is_ok()
    }

    /// Refuse every queued and future acquisition.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            self.semaphore.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            active: self.counters.active.load(Ordering::Acquire),
            queued: self.counters.queued.load(Ordering::Acquire),
            completed: self.counters.completed.load(Ordering::Relaxed),
        }
    }
}
