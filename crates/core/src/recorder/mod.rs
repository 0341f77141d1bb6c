//! Result recording: terminal task outcomes, batch snapshots and the event log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::batch::{BatchHandle, Completion};
use crate::events::Event;
use crate::metrics::PERSISTENCE_FAILURES;
use crate::store::{RunStore, StoreError};
use crate::task::{Outcome, Task, TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Task {0} does not belong to this batch")]
    UnknownTask(TaskId),

    /// Recording a task that is not running, most often a second recording.
    #[error("Task {task_id} is {status:?}, not running")]
    NotRunning { task_id: TaskId, status: TaskStatus },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Persistence paths that can degrade independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    Task,
    Batch,
    Event,
}

impl WritePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            WritePath::Task => "task",
            WritePath::Batch => "batch",
            WritePath::Event => "event",
        }
    }
}

/// Single writer of terminal task state.
///
/// Counter updates happen in memory under the batch lock; the store writes
/// that follow are retried a bounded number of times and then mark their
/// path degraded. Nothing here aborts a batch.
pub struct ResultRecorder {
    store: Arc<dyn RunStore>,
    retries: u32,
    retry_delay: Duration,
    task_degraded: AtomicBool,
    batch_degraded: AtomicBool,
    /// Serializes snapshot-then-write of batch rows.
    batch_writes: Mutex<()>,
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn RunStore>, retries: u32, retry_delay: Duration) -> Self {
        Self {
            store,
            retries: retries.max(1),
            retry_delay,
            task_degraded: AtomicBool::new(false),
            batch_degraded: AtomicBool::new(false),
            batch_writes: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Record a running task's terminal outcome.
    ///
    /// The counter increment and the task state change are one atomic step
    /// on the batch. The task row is then written through to the store.
    pub async fn record(
        &self,
        batch: &BatchHandle,
        task_id: TaskId,
        outcome: &Outcome,
    ) -> Result<Completion, RecordError> {
        let completion = batch.complete_task(task_id, outcome)?;
        if !self.save_task(&completion.task).await {
            batch.set_error("task persistence degraded");
        }
        Ok(completion)
    }

    /// Write a task row with bounded retries. Returns false if it gave up.
    pub async fn save_task(&self, task: &Task) -> bool {
        self.write_with_retry(WritePath::Task, || self.store.save_task(task))
            .await
    }

    /// Write the initial task rows of a new batch.
    pub async fn save_tasks(&self, tasks: &[Task]) -> bool {
        self.write_with_retry(WritePath::Task, || self.store.save_tasks(tasks))
            .await
    }

    /// Write the batch row with bounded retries.
    ///
    /// Each attempt takes a fresh snapshot, so a retry that outlives a state
    /// change writes the newer state rather than the one it started with.
    pub async fn save_batch(&self, batch: &BatchHandle) -> bool {
        self.write_with_retry(WritePath::Batch, || {
            let _guard = self
                .batch_writes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.store.save_batch(&batch.snapshot())
        })
        .await
    }

    /// Append one event to the log. Failures are logged and dropped.
    pub fn record_event(&self, event: &Event) {
        if let Err(e) = self.store.append_event(event) {
            PERSISTENCE_FAILURES
                .with_label_values(&[WritePath::Event.as_str()])
                .inc();
            tracing::error!(batch_id = %event.batch_id, "Failed to append event: {}", e);
        }
    }

    pub fn is_degraded(&self, path: WritePath) -> bool {
        match path {
            WritePath::Task => self.task_degraded.load(Ordering::Relaxed),
            WritePath::Batch => self.batch_degraded.load(Ordering::Relaxed),
            WritePath::Event => false,
        }
    }

    async fn write_with_retry<F>(&self, path: WritePath, write: F) -> bool
    where
        F: Fn() -> Result<(), StoreError>,
    {
        for attempt in 1..=self.retries {
            match write() {
                Ok(()) => return true,
                Err(e) => {
                    PERSISTENCE_FAILURES.with_label_values(&[path.as_str()]).inc();
                    tracing::warn!(
                        path = path.as_str(),
                        attempt,
                        max_attempts = self.retries,
                        "Store write failed: {}",
                        e
                    );
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        let flag = match path {
            WritePath::Task => &self.task_degraded,
            WritePath::Batch => &self.batch_degraded,
            WritePath::Event => return false,
        };
        if !flag.swap(true, Ordering::Relaxed) {
            tracing::error!(path = path.as_str(), "Persistence path degraded");
        }
        false
    }
}
