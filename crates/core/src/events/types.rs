use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::task::TaskId;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(EventLevel::Debug),
            "info" => Some(EventLevel::Info),
            "warn" => Some(EventLevel::Warn),
            "error" => Some(EventLevel::Error),
            _ => None,
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BatchStarted,
    BatchStopRequested,
    BatchFinished,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    StepStarted,
    /// First failed attempt of a step that will be retried.
    StepFailed,
    StepSucceeded,
    /// Step exhausted its attempts or hit a terminal failure.
    StepGaveUp,
    /// Free-form driver progress line.
    Log,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BatchStarted => "batch_started",
            EventKind::BatchStopRequested => "batch_stop_requested",
            EventKind::BatchFinished => "batch_finished",
            EventKind::TaskStarted => "task_started",
            EventKind::TaskSucceeded => "task_succeeded",
            EventKind::TaskFailed => "task_failed",
            EventKind::StepStarted => "step_started",
            EventKind::StepFailed => "step_failed",
            EventKind::StepSucceeded => "step_succeeded",
            EventKind::StepGaveUp => "step_gave_up",
            EventKind::Log => "log",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "batch_started" => EventKind::BatchStarted,
            "batch_stop_requested" => EventKind::BatchStopRequested,
            "batch_finished" => EventKind::BatchFinished,
            "task_started" => EventKind::TaskStarted,
            "task_succeeded" => EventKind::TaskSucceeded,
            "task_failed" => EventKind::TaskFailed,
            "step_started" => EventKind::StepStarted,
            "step_failed" => EventKind::StepFailed,
            "step_succeeded" => EventKind::StepSucceeded,
            "step_gave_up" => EventKind::StepGaveUp,
            "log" => EventKind::Log,
            _ => return None,
        };
        Some(kind)
    }
}

/// Append-only progress record for a batch or one of its tasks.
///
/// Events are never mutated or deduplicated. `seq` is assigned by the
/// dispatcher when the event enters the per-batch log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub batch_id: BatchId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Event {
    pub fn new(
        batch_id: BatchId,
        level: EventLevel,
        kind: EventKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            batch_id,
            seq: None,
            task_id: None,
            timestamp: Utc::now(),
            level,
            kind,
            step: None,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let batch_id = BatchId::new();
        let task_id = TaskId::new();
        let event = Event::new(batch_id, EventLevel::Warn, EventKind::StepFailed, "retrying")
            .with_task(task_id)
            .with_step("cart_populate")
            .with_metadata(serde_json::json!({"attempt": 1}));

        assert_eq!(event.batch_id, batch_id);
        assert_eq!(event.task_id, Some(task_id));
        assert_eq!(event.step.as_deref(), Some("cart_populate"));
        assert_eq!(event.metadata["attempt"], 1);
        assert!(event.seq.is_none());
    }

    #[test]
    fn test_event_serializes_snake_case() {
        let event = Event::new(
            BatchId::new(),
            EventLevel::Info,
            EventKind::BatchFinished,
            "done",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "batch_finished");
        assert_eq!(json["level"], "info");
        assert!(json.get("task_id").is_none());
    }

    #[test]
    fn test_kind_parse_matches_as_str() {
        for kind in [
            EventKind::BatchStarted,
            EventKind::StepGaveUp,
            EventKind::StepFailed,
            EventKind::Log,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("nope"), None);
    }
}
