use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::BatchId;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Classification of a task failure.
///
/// `SessionExpired` is kept apart from the other kinds so operators can tell
/// "credentials need refreshing" from "the site misbehaved".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Stored session was rejected by the site. Never retried.
    SessionExpired,
    /// Network or site error that stayed broken through every retry.
    TransientExternal,
    /// Site answered but refused the operation, or a guard rejected its result.
    Rejected,
    /// The task or a step call did not return in time.
    Timeout,
    /// No credential or empty session material for the account.
    MissingCredential,
    /// A store read needed to run the task failed.
    Persistence,
    /// The driver panicked or broke an internal contract.
    InternalFault,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::TransientExternal => "transient_external",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MissingCredential => "missing_credential",
            ErrorKind::Persistence => "persistence",
            ErrorKind::InternalFault => "internal_fault",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_expired" => Ok(ErrorKind::SessionExpired),
            "transient_external" => Ok(ErrorKind::TransientExternal),
            "rejected" => Ok(ErrorKind::Rejected),
            "timeout" => Ok(ErrorKind::Timeout),
            "missing_credential" => Ok(ErrorKind::MissingCredential),
            "persistence" => Ok(ErrorKind::Persistence),
            "internal_fault" => Ok(ErrorKind::InternalFault),
            other => Err(format!("unknown error kind: {}", other)),
        }
    }
}

/// Failure details attached to a failed outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    /// Workflow step that failed, for order tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// Data produced by a successful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Order {
        order_number: String,
        total: f64,
    },
    Checkpoint {
        points: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tier: Option<String>,
    },
}

impl TaskPayload {
    /// Point balance carried by a checkpoint payload.
    pub fn points(&self) -> Option<f64> {
        match self {
            TaskPayload::Checkpoint { points, .. } => Some(*points),
            TaskPayload::Order { .. } => None,
        }
    }
}

/// Top-level status reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    SessionExpired,
}

/// Result of running one task through its driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub payload: Option<TaskPayload>,
    pub error: Option<TaskError>,
}

impl Outcome {
    pub fn success(payload: TaskPayload) -> Self {
        Self {
            status: OutcomeStatus::Success,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = if kind == ErrorKind::SessionExpired {
            OutcomeStatus::SessionExpired
        } else {
            OutcomeStatus::Failed
        };
        Self {
            status,
            payload: None,
            error: Some(TaskError {
                kind,
                message: message.into(),
                step: None,
            }),
        }
    }

    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::failed(ErrorKind::SessionExpired, message)
    }

    /// Tag the failure with the workflow step that produced it.
    pub fn at_step(mut self, step: impl Into<String>) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.step = Some(step.into());
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// One (account, repetition) unit within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub batch_id: BatchId,
    pub account_id: u64,
    /// Zero-based repetition index.
    pub repetition: u32,
    pub status: TaskStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub payload: Option<TaskPayload>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn pending(batch_id: BatchId, account_id: u64, repetition: u32) -> Self {
        Self {
            id: TaskId::new(),
            batch_id,
            account_id,
            repetition,
            status: TaskStatus::Pending,
            error_kind: None,
            error: None,
            failed_step: None,
            payload: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a terminal outcome. The caller guarantees the task is running.
    pub(crate) fn finish(&mut self, outcome: &Outcome) {
        self.status = if outcome.is_success() {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        self.payload = outcome.payload.clone();
        if let Some(error) = &outcome.error {
            self.error_kind = Some(error.kind);
            self.error = Some(error.message.clone());
            self.failed_step = error.step.clone();
        }
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_expired_outcome_has_distinct_status() {
        let outcome = Outcome::failed(ErrorKind::SessionExpired, "302 to login");
        assert_eq!(outcome.status, OutcomeStatus::SessionExpired);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::SessionExpired));

        let generic = Outcome::failed(ErrorKind::TransientExternal, "502");
        assert_eq!(generic.status, OutcomeStatus::Failed);
    }

    #[test]
    fn test_finish_copies_error_and_step() {
        let mut task = Task::pending(BatchId::new(), 7, 0);
        task.status = TaskStatus::Running;

        let outcome = Outcome::failed(ErrorKind::Rejected, "cart total 0").at_step("cart_populate");
        task.finish(&outcome);

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_kind, Some(ErrorKind::Rejected));
        assert_eq!(task.failed_step.as_deref(), Some("cart_populate"));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_payload_serialization() {
        let payload = TaskPayload::Checkpoint {
            points: 120.5,
            tier: Some("Gold".to_string()),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "checkpoint");
        assert_eq!(json["points"], 120.5);
        assert_eq!(payload.points(), Some(120.5));
    }

    #[test]
    fn test_error_kind_round_trips_through_str() {
        for kind in [
            ErrorKind::SessionExpired,
            ErrorKind::Timeout,
            ErrorKind::MissingCredential,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
    }
}
