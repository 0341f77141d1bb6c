use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Event, EventBroadcaster, EventEmitter};
use crate::batch::BatchId;
use crate::recorder::ResultRecorder;

/// Background task that drains the event channel.
///
/// Each event gets the next sequence number for its batch, is appended to
/// the event log through the recorder, then published to subscribers.
pub struct EventDispatcher {
    rx: mpsc::Receiver<Event>,
    recorder: Arc<ResultRecorder>,
    broadcaster: EventBroadcaster,
    sequences: HashMap<BatchId, u64>,
}

impl EventDispatcher {
    pub fn new(
        rx: mpsc::Receiver<Event>,
        recorder: Arc<ResultRecorder>,
        broadcaster: EventBroadcaster,
    ) -> Self {
        Self {
            rx,
            recorder,
            broadcaster,
            sequences: HashMap::new(),
        }
    }

    /// Run until every emitter has been dropped.
    ///
    /// Spawn with `tokio::spawn(dispatcher.run())`.
    pub async fn run(mut self) {
        tracing::info!("Event dispatcher started");

        while let Some(mut event) = self.rx.recv().await {
            let seq = self.sequences.entry(event.batch_id).or_insert(0);
            *seq += 1;
            event.seq = Some(*seq);

            self.recorder.record_event(&event);
            self.broadcaster.publish(event);
        }

        tracing::info!("Event dispatcher shutting down");
    }
}

/// Create the worker-to-subscriber event pipeline.
///
/// Returns:
/// - `EventEmitter` - clone into workers
/// - `EventDispatcher` - spawn with `tokio::spawn(dispatcher.run())`
pub fn create_event_pipeline(
    recorder: Arc<ResultRecorder>,
    broadcaster: EventBroadcaster,
    buffer_size: usize,
) -> (EventEmitter, EventDispatcher) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let emitter = EventEmitter::new(tx);
    let dispatcher = EventDispatcher::new(rx, recorder, broadcaster);
    (emitter, dispatcher)
}
