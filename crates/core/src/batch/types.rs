//! Batch data model and controller errors.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;
use crate::task::{ErrorKind, Task, TaskId, TaskPayload, TaskStatus};

/// Unique batch identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Inclusive range of account numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRange {
    pub start: u64,
    pub end: u64,
}

impl AccountRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of accounts covered. Zero for an inverted range.
    pub fn len(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn accounts(&self) -> RangeInclusive<u64> {
        self.start..=self.end
    }
}

impl fmt::Display for AccountRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Which driver a batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    Order,
    Checkpoint,
}

impl BatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::Order => "order",
            BatchMode::Checkpoint => "checkpoint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Running,
    Completed,
    Stopped,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::Stopped => "stopped",
        }
    }
}

/// Task counts of a batch. `submitted` always equals the sum of the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCounters {
    pub submitted: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchCounters {
    pub fn new(submitted: usize) -> Self {
        Self {
            submitted,
            pending: submitted,
            ..Default::default()
        }
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn is_consistent(&self) -> bool {
        self.submitted == self.succeeded + self.failed + self.pending + self.running
    }
}

/// Snapshot of a batch, as persisted and reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub created_at: DateTime<Utc>,
    pub range: AccountRange,
    pub repetition_count: u32,
    pub concurrency_limit: usize,
    pub mode: BatchMode,
    pub state: BatchState,
    pub counters: BatchCounters,
    pub stop_requested: bool,
    pub finished_at: Option<DateTime<Utc>>,
    /// Sum of point balances read by a checkpoint batch.
    pub total_points: Option<f64>,
}

/// Pull-based progress view of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub mode: BatchMode,
    pub state: BatchState,
    /// Tasks that reached a terminal outcome.
    pub progress: usize,
    pub total: usize,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    pub stop_requested: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_points: Option<f64>,
    /// Batch-level problem, such as a degraded persistence path.
    pub error: Option<String>,
}

impl BatchStatus {
    pub fn from_batch(batch: &Batch, error: Option<String>) -> Self {
        let counters = batch.counters;
        Self {
            batch_id: batch.id,
            mode: batch.mode,
            state: batch.state,
            progress: counters.finished(),
            total: counters.submitted,
            submitted: counters.submitted,
            succeeded: counters.succeeded,
            failed: counters.failed,
            running: counters.running,
            pending: counters.pending,
            stop_requested: batch.stop_requested,
            created_at: batch.created_at,
            finished_at: batch.finished_at,
            total_points: batch.total_points,
            error,
        }
    }
}

/// Terminal result of one task, as returned by `results()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub account_id: u64,
    pub repetition: u32,
    pub outcome: TaskStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub payload: Option<TaskPayload>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskResult {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            account_id: task.account_id,
            repetition: task.repetition,
            outcome: task.status,
            error_kind: task.error_kind,
            error: task.error.clone(),
            failed_step: task.failed_step.clone(),
            payload: task.payload.clone(),
            checked_at: task.completed_at,
        }
    }
}

/// Reply to a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAck {
    pub acknowledged: bool,
    /// Stop had already been requested, or the batch was already terminal.
    pub already_stopping: bool,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Batch not found: {0}")]
    NotFound(BatchId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_range_len() {
        assert_eq!(AccountRange::new(1, 5).len(), 5);
        assert_eq!(AccountRange::new(3, 3).len(), 1);
        assert_eq!(AccountRange::new(5, 1).len(), 0);
        assert!(AccountRange::new(5, 1).is_empty());
        assert_eq!(AccountRange::new(2, 4).accounts().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_counters_consistency() {
        let mut counters = BatchCounters::new(4);
        assert!(counters.is_consistent());

        counters.pending -= 1;
        counters.running += 1;
        assert!(counters.is_consistent());

        counters.running -= 1;
        assert!(!counters.is_consistent());
    }

    #[test]
    fn test_status_from_batch() {
        let mut counters = BatchCounters::new(5);
        counters.pending = 1;
        counters.running = 1;
        counters.succeeded = 2;
        counters.failed = 1;

        let batch = Batch {
            id: BatchId::new(),
            created_at: Utc::now(),
            range: AccountRange::new(1, 5),
            repetition_count: 1,
            concurrency_limit: 2,
            mode: BatchMode::Checkpoint,
            state: BatchState::Running,
            counters,
            stop_requested: false,
            finished_at: None,
            total_points: None,
        };

        let status = BatchStatus::from_batch(&batch, None);
        assert_eq!(status.progress, 3);
        assert_eq!(status.total, 5);
        assert_eq!(status.pending, 1);
        assert_eq!(status.state, BatchState::Running);
    }

    #[test]
    fn test_batch_id_parse() {
        let id = BatchId::new();
        let parsed: BatchId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<BatchId>().is_err());
    }
}
