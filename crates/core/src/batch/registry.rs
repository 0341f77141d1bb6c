//! In-memory index of batches and their tasks.
//!
//! A [`BatchHandle`] holds the live state of one batch behind a single
//! mutex, so every counter change is one critical section and a status read
//! always sees `submitted == pending + running + succeeded + failed`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify, RwLock};

use super::{
    AccountRange, Batch, BatchCounters, BatchId, BatchMode, BatchState, BatchStatus, TaskResult,
};
use crate::recorder::RecordError;
use crate::task::{Outcome, Task, TaskId, TaskStatus};

/// Why a task could not move from pending to running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    StopRequested,
    UnknownTask(TaskId),
    NotPending(TaskStatus),
}

/// Effect of recording one terminal outcome.
#[derive(Debug, Clone)]
pub struct Completion {
    pub task: Task,
    /// Set when this outcome made the batch terminal.
    pub finished: Option<Batch>,
}

/// Effect of a stop request.
#[derive(Debug, Clone)]
pub struct StopTransition {
    /// False if stop had already been requested or the batch was terminal.
    pub newly_requested: bool,
    /// Set when nothing was running, so the batch stopped immediately.
    pub finished: Option<Batch>,
}

struct BatchInner {
    state: BatchState,
    counters: BatchCounters,
    stop_requested: bool,
    finished_at: Option<DateTime<Utc>>,
    total_points: Option<f64>,
    error: Option<String>,
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
}

/// Live state of one batch.
pub struct BatchHandle {
    id: BatchId,
    created_at: DateTime<Utc>,
    range: AccountRange,
    repetition_count: u32,
    concurrency_limit: usize,
    mode: BatchMode,
    inner: Mutex<BatchInner>,
    stop_notify: Notify,
    finished_tx: watch::Sender<bool>,
}

impl BatchHandle {
    /// Create the batch with one pending task per (account, repetition),
    /// account by account in increasing order.
    pub fn new(
        range: AccountRange,
        repetition_count: u32,
        concurrency_limit: usize,
        mode: BatchMode,
    ) -> Self {
        let id = BatchId::new();
        let mut tasks = Vec::new();
        for account_id in range.accounts() {
            for repetition in 0..repetition_count {
                tasks.push(Task::pending(id, account_id, repetition));
            }
        }
        let index = tasks.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
        let (finished_tx, _) = watch::channel(false);

        Self {
            id,
            created_at: Utc::now(),
            range,
            repetition_count,
            concurrency_limit,
            mode,
            inner: Mutex::new(BatchInner {
                state: BatchState::Running,
                counters: BatchCounters::new(tasks.len()),
                stop_requested: false,
                finished_at: None,
                total_points: None,
                error: None,
                tasks,
                index,
            }),
            stop_notify: Notify::new(),
            finished_tx,
        }
    }

    fn inner(&self) -> MutexGuard<'_, BatchInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn range(&self) -> AccountRange {
        self.range
    }

    pub fn counters(&self) -> BatchCounters {
        self.inner().counters
    }

    pub fn state(&self) -> BatchState {
        self.inner().state
    }

    pub fn snapshot(&self) -> Batch {
        let inner = self.inner();
        self.snapshot_locked(&inner)
    }

    fn snapshot_locked(&self, inner: &BatchInner) -> Batch {
        Batch {
            id: self.id,
            created_at: self.created_at,
            range: self.range,
            repetition_count: self.repetition_count,
            concurrency_limit: self.concurrency_limit,
            mode: self.mode,
            state: inner.state,
            counters: inner.counters,
            stop_requested: inner.stop_requested,
            finished_at: inner.finished_at,
            total_points: inner.total_points,
        }
    }

    pub fn status(&self) -> BatchStatus {
        let inner = self.inner();
        BatchStatus::from_batch(&self.snapshot_locked(&inner), inner.error.clone())
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> Vec<Task> {
        self.inner().tasks.clone()
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        let inner = self.inner();
        inner.index.get(&id).map(|&i| inner.tasks[i].clone())
    }

    /// Terminal tasks in creation order.
    pub fn results(&self) -> Vec<TaskResult> {
        self.inner()
            .tasks
            .iter()
            .filter(|t| t.status.is_terminal())
            .map(TaskResult::from)
            .collect()
    }

    /// First repetition of every account, in account order.
    pub fn first_repetitions(&self) -> Vec<TaskId> {
        self.inner()
            .tasks
            .iter()
            .filter(|t| t.repetition == 0)
            .map(|t| t.id)
            .collect()
    }

    /// The repetition that follows `id` on the same account.
    pub fn next_repetition(&self, id: TaskId) -> Option<TaskId> {
        let inner = self.inner();
        let i = *inner.index.get(&id)?;
        let current = &inner.tasks[i];
        inner
            .tasks
            .get(i + 1)
            .filter(|next| next.account_id == current.account_id)
            .map(|next| next.id)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner().stop_requested
    }

    /// Resolves once stop has been requested.
    pub async fn stop_signal(&self) {
        loop {
            let notified = self.stop_notify.notified();
            if self.is_stop_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once the batch is terminal.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished_tx.subscribe();
        // The sender lives as long as self
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Move a task from pending to running.
    ///
    /// The stop flag is checked in the same critical section, so no task
    /// starts once stop has been requested.
    pub fn begin_task(&self, id: TaskId) -> Result<Task, AdmissionError> {
        let mut inner = self.inner();
        if inner.stop_requested {
            return Err(AdmissionError::StopRequested);
        }
        let i = *inner
            .index
            .get(&id)
            .ok_or(AdmissionError::UnknownTask(id))?;
        let status = inner.tasks[i].status;
        if status != TaskStatus::Pending {
            return Err(AdmissionError::NotPending(status));
        }

        let task = &mut inner.tasks[i];
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        let task = task.clone();

        inner.counters.pending -= 1;
        inner.counters.running += 1;
        Ok(task)
    }

    /// Apply a terminal outcome to a running task and bump exactly one of
    /// the succeeded/failed counters.
    ///
    /// Only the [`ResultRecorder`](crate::recorder::ResultRecorder) calls
    /// this. A task that is not running is rejected, which is what makes a
    /// second recording of the same task an error.
    pub(crate) fn complete_task(
        &self,
        id: TaskId,
        outcome: &Outcome,
    ) -> Result<Completion, RecordError> {
        let mut inner = self.inner();
        let i = *inner.index.get(&id).ok_or(RecordError::UnknownTask(id))?;
        let status = inner.tasks[i].status;
        if status != TaskStatus::Running {
            return Err(RecordError::NotRunning {
                task_id: id,
                status,
            });
        }

        inner.tasks[i].finish(outcome);
        let task = inner.tasks[i].clone();

        inner.counters.running -= 1;
        if outcome.is_success() {
            inner.counters.succeeded += 1;
        } else {
            inner.counters.failed += 1;
        }
        if let Some(points) = outcome.payload.as_ref().and_then(|p| p.points()) {
            *inner.total_points.get_or_insert(0.0) += points;
        }

        let finished = self.finish_if_idle(&mut inner);
        Ok(Completion { task, finished })
    }

    pub(crate) fn request_stop(&self) -> StopTransition {
        let mut inner = self.inner();
        if inner.stop_requested || inner.state.is_terminal() {
            return StopTransition {
                newly_requested: false,
                finished: None,
            };
        }
        inner.stop_requested = true;
        let finished = self.finish_if_idle(&mut inner);
        drop(inner);

        self.stop_notify.notify_waiters();
        StopTransition {
            newly_requested: true,
            finished,
        }
    }

    /// Record a batch-level problem surfaced through `status()`.
    pub(crate) fn set_error(&self, message: impl Into<String>) {
        self.inner().error = Some(message.into());
    }

    /// Terminal once nothing is running and either nothing is pending or
    /// stop was requested. Pending tasks left behind by a stop never run.
    fn finish_if_idle(&self, inner: &mut BatchInner) -> Option<Batch> {
        if inner.state.is_terminal() || inner.counters.running > 0 {
            return None;
        }
        if inner.counters.pending > 0 && !inner.stop_requested {
            return None;
        }

        inner.state = if inner.counters.pending == 0 {
            BatchState::Completed
        } else {
            BatchState::Stopped
        };
        inner.finished_at = Some(Utc::now());
        self.finished_tx.send_replace(true);
        Some(self.snapshot_locked(inner))
    }
}

/// Registry of every batch started by this process.
#[derive(Default)]
pub struct BatchRegistry {
    batches: RwLock<HashMap<BatchId, Arc<BatchHandle>>>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: Arc<BatchHandle>) {
        self.batches.write().await.insert(handle.id(), handle);
    }

    pub async fn get(&self, id: &BatchId) -> Option<Arc<BatchHandle>> {
        self.batches.read().await.get(id).cloned()
    }

    /// Every batch, newest first.
    pub async fn list(&self) -> Vec<Arc<BatchHandle>> {
        let mut batches: Vec<_> = self.batches.read().await.values().cloned().collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        batches
    }

    pub async fn running(&self) -> Vec<Arc<BatchHandle>> {
        self.list()
            .await
            .into_iter()
            .filter(|b| !b.state().is_terminal())
            .collect()
    }
}
