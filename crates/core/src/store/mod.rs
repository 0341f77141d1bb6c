//! Persistence collaborators: run history and account data.

mod accounts;
mod sqlite;
mod types;

pub use accounts::*;
pub use sqlite::*;
pub use types::*;

use thiserror::Error;

use crate::batch::{Batch, BatchId};
use crate::events::{Event, EventKind, EventLevel};
use crate::task::{Task, TaskId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Filter for querying the event log
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub batch_id: Option<BatchId>,
    pub task_id: Option<TaskId>,
    pub kind: Option<EventKind>,
    pub min_level: Option<EventLevel>,
    pub limit: i64,
    pub offset: i64,
}

impl EventFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            offset: 0,
            ..Default::default()
        }
    }

    pub fn with_batch_id(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_min_level(mut self, level: EventLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Storage for batch snapshots, task states and the event log.
pub trait RunStore: Send + Sync {
    /// Insert or replace a batch snapshot.
    fn save_batch(&self, batch: &Batch) -> Result<(), StoreError>;

    fn load_batch(&self, id: &BatchId) -> Result<Option<Batch>, StoreError>;

    /// Most recent batches first.
    fn list_batches(&self, limit: i64) -> Result<Vec<Batch>, StoreError>;

    /// Insert or replace a task, keyed by (batch, account, repetition).
    fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Several tasks in one transaction.
    fn save_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        for task in tasks {
            self.save_task(task)?;
        }
        Ok(())
    }

    /// Tasks of a batch ordered by account then repetition.
    fn list_tasks(&self, batch_id: &BatchId) -> Result<Vec<Task>, StoreError>;

    /// Append to the event log. Events without a sequence number get the
    /// next one for their batch.
    fn append_event(&self, event: &Event) -> Result<(), StoreError>;

    fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError>;

    fn count_events(&self, filter: &EventFilter) -> Result<i64, StoreError>;
}

/// Read access to account credentials and order inputs.
///
/// Managing these records is an external concern; the engine only reads.
pub trait AccountStore: Send + Sync {
    fn load_credential(&self, account_id: u64) -> Result<Option<AccountCredential>, StoreError>;

    fn load_product(&self, id: &str) -> Result<Option<Product>, StoreError>;

    fn load_address(&self, id: &str) -> Result<Option<Address>, StoreError>;

    fn load_card(&self, id: &str) -> Result<Option<Card>, StoreError>;
}
