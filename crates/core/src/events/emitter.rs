use tokio::sync::mpsc;

use super::{Event, EventKind, EventLevel};
use crate::batch::BatchId;
use crate::metrics::EVENTS_DROPPED;
use crate::task::TaskId;

/// Handle for emitting events from workers.
///
/// Cheaply cloneable. Events go through a bounded channel to the
/// [`EventDispatcher`](super::EventDispatcher); emitting never waits, so a
/// full channel drops the event instead of stalling the worker.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<Event>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Emit an event without blocking.
    ///
    /// Returns true if the event was queued.
    pub fn emit(&self, event: Event) -> bool {
        trace_event(&event);
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                EVENTS_DROPPED.inc();
                tracing::warn!(
                    batch_id = %event.batch_id,
                    kind = event.kind.as_str(),
                    "Event channel full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                EVENTS_DROPPED.inc();
                tracing::debug!("Event channel closed, dropping event");
                false
            }
        }
    }

    /// Scope for events that belong to one batch.
    pub fn for_batch(&self, batch_id: BatchId) -> EventScope {
        EventScope {
            emitter: self.clone(),
            batch_id,
            task_id: None,
        }
    }
}

/// Emitter pre-bound to a batch and optionally a task.
#[derive(Debug, Clone)]
pub struct EventScope {
    emitter: EventEmitter,
    batch_id: BatchId,
    task_id: Option<TaskId>,
}

impl EventScope {
    pub fn for_task(&self, task_id: TaskId) -> EventScope {
        EventScope {
            emitter: self.emitter.clone(),
            batch_id: self.batch_id,
            task_id: Some(task_id),
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    /// Build an event bound to this scope without sending it.
    pub fn event(&self, level: EventLevel, kind: EventKind, message: impl Into<String>) -> Event {
        let event = Event::new(self.batch_id, level, kind, message);
        match self.task_id {
            Some(task_id) => event.with_task(task_id),
            None => event,
        }
    }

    pub fn emit(&self, event: Event) -> bool {
        self.emitter.emit(event)
    }

    /// Shorthand for an info-level log line.
    pub fn log(&self, message: impl Into<String>) -> bool {
        self.emit(self.event(EventLevel::Info, EventKind::Log, message))
    }
}

fn trace_event(event: &Event) {
    let kind = event.kind.as_str();
    let step = event.step.as_deref().unwrap_or("");
    match event.level {
        EventLevel::Debug => {
            tracing::debug!(batch_id = %event.batch_id, kind, step, "{}", event.message)
        }
        EventLevel::Info => {
            tracing::info!(batch_id = %event.batch_id, kind, step, "{}", event.message)
        }
        EventLevel::Warn => {
            tracing::warn!(batch_id = %event.batch_id, kind, step, "{}", event.message)
        }
        EventLevel::Error => {
            tracing::error!(batch_id = %event.batch_id, kind, step, "{}", event.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_event() {
        let (tx, mut rx) = mpsc::channel(10);
        let emitter = EventEmitter::new(tx);
        let batch_id = BatchId::new();

        assert!(emitter.emit(Event::new(
            batch_id,
            EventLevel::Info,
            EventKind::BatchStarted,
            "started"
        )));

        let event = rx.recv().await.expect("Should receive event");
        assert_eq!(event.kind, EventKind::BatchStarted);
        assert_eq!(event.batch_id, batch_id);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let emitter = EventEmitter::new(tx);
        let scope = emitter.for_batch(BatchId::new());

        assert!(scope.log("first"));
        assert!(!scope.log("second"));

        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_returns_false() {
        let (tx, rx) = mpsc::channel(4);
        let emitter = EventEmitter::new(tx);
        drop(rx);

        assert!(!emitter.for_batch(BatchId::new()).log("nobody listening"));
    }

    #[tokio::test]
    async fn test_task_scope_tags_events() {
        let (tx, mut rx) = mpsc::channel(4);
        let batch_id = BatchId::new();
        let task_id = TaskId::new();
        let scope = EventEmitter::new(tx).for_batch(batch_id).for_task(task_id);

        scope.emit(
            scope
                .event(EventLevel::Warn, EventKind::StepFailed, "retry")
                .with_step("checkout"),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.batch_id, batch_id);
        assert_eq!(event.task_id, Some(task_id));
        assert_eq!(event.step.as_deref(), Some("checkout"));
    }
}
