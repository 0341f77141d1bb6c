//! Bounded worker slots for one batch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::batch::{AdmissionError, BatchHandle};
use crate::task::{Task, TaskId};

/// Usage counters shared between the limiter and its slots.
#[derive(Default)]
struct SlotStats {
    running: AtomicUsize,
    peak: AtomicUsize,
    admitted: AtomicUsize,
}

/// Admits at most `limit` tasks at a time.
///
/// Waiters are served in arrival order. A [`Slot`] is released when dropped,
/// which covers success, failure, timeout and a panicking driver alike.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
    stats: Arc<SlotStats>,
}

/// Result of trying to admit one task.
#[derive(Debug)]
pub enum Admission {
    /// The task is now running and owns the slot.
    Admitted(Slot, Task),
    /// Stop was requested, or the limiter closed, before the task could start.
    Cancelled,
    /// The task was not pending; nothing was started.
    Rejected(AdmissionError),
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            stats: Arc::new(SlotStats::default()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots held right now.
    pub fn running(&self) -> usize {
        self.stats.running.load(Ordering::SeqCst)
    }

    /// Highest number of slots ever held at once.
    pub fn peak(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    pub fn admitted(&self) -> usize {
        self.stats.admitted.load(Ordering::SeqCst)
    }

    /// Wait for a free slot. `None` once the limiter is closed.
    pub async fn acquire(&self) -> Option<Slot> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        let running = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(running, Ordering::SeqCst);
        Some(Slot {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Refuse all further acquisitions. Held slots stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Acquire a slot for `task_id` and move it to running.
    ///
    /// Waiting for the slot is abandoned as soon as stop is requested, and
    /// the pending to running transition re-checks the stop flag under the
    /// batch lock, so a task racing with stop never starts.
    pub async fn admit(&self, batch: &BatchHandle, task_id: TaskId) -> Admission {
        if batch.is_stop_requested() {
            return Admission::Cancelled;
        }

        let slot = tokio::select! {
            biased;
            _ = batch.stop_signal() => return Admission::Cancelled,
            slot = self.acquire() => match slot {
                Some(slot) => slot,
                None => return Admission::Cancelled,
            },
        };

        match batch.begin_task(task_id) {
            Ok(task) => {
                self.stats.admitted.fetch_add(1, Ordering::SeqCst);
                Admission::Admitted(slot, task)
            }
            Err(AdmissionError::StopRequested) => Admission::Cancelled,
            Err(e) => Admission::Rejected(e),
        }
    }
}

/// A held worker slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    stats: Arc<SlotStats>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.stats.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SlotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotStats")
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
