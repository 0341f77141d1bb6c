//! Event stream integration tests: ordering, late subscribers and lag.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{collect_until_finished, TestHarness};
use tempfile::TempDir;

use cartpilot_core::{
    create_event_pipeline,
    testing::{MockAccountApi, MockOrderSite},
    AccountRange, BatchConfig, BatchId, BatchState, CheckpointTaskConfig, Event, EventBroadcaster,
    EventFilter, EventKind, EventLevel, Received, ResultRecorder, RunStore, SqliteRunStore,
    TaskConfig,
};

fn checkpoint() -> BatchConfig {
    BatchConfig::new(TaskConfig::Checkpoint(CheckpointTaskConfig {
        inter_account_delay_ms: Some(0),
    }))
}

#[tokio::test]
async fn test_events_arrive_in_sequence() {
    let harness = TestHarness::new(MockAccountApi::new(), MockOrderSite::new());
    let mut subscription = harness.broadcaster.subscribe();

    let id = harness
        .controller
        .start(AccountRange::new(1, 4), checkpoint().with_concurrency(2))
        .await
        .unwrap();
    let events = collect_until_finished(&mut subscription, id).await;

    assert_eq!(events.first().map(|e| e.kind), Some(EventKind::BatchStarted));
    assert_eq!(events.last().map(|e| e.kind), Some(EventKind::BatchFinished));

    let seqs: Vec<u64> = events.iter().filter_map(|e| e.seq).collect();
    assert_eq!(seqs.len(), events.len());
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));

    let succeeded = events
        .iter()
        .filter(|e| e.kind == EventKind::TaskSucceeded)
        .count();
    assert_eq!(succeeded, 4);

    let finished = events.last().unwrap();
    assert_eq!(finished.metadata["succeeded"], 4);
    assert_eq!(finished.metadata["state"], "completed");
}

#[tokio::test]
async fn test_every_task_event_precedes_batch_finished() {
    let harness = TestHarness::new(MockAccountApi::new(), MockOrderSite::new());

    for round in 0..5u64 {
        let mut subscription = harness.broadcaster.subscribe();
        let id = harness
            .controller
            .start(AccountRange::new(1, 8), checkpoint().with_concurrency(8))
            .await
            .unwrap();
        let events = collect_until_finished(&mut subscription, id).await;

        let finished = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::TaskSucceeded | EventKind::TaskFailed))
            .count();
        assert_eq!(finished, 8, "round {}", round);
        assert_eq!(events.last().map(|e| e.kind), Some(EventKind::BatchFinished));
        assert!(subscription.try_next_event().is_none());
    }
}

#[tokio::test]
async fn test_events_are_not_deduplicated() {
    let harness = TestHarness::new(
        MockAccountApi::new()
            .with_points(1, 50.0, None)
            .with_points(2, 50.0, None),
        MockOrderSite::new(),
    );
    let mut subscription = harness.broadcaster.subscribe();

    let id = harness
        .controller
        .start(AccountRange::new(1, 2), checkpoint())
        .await
        .unwrap();
    let events = collect_until_finished(&mut subscription, id).await;

    let streamed_logs = events.iter().filter(|e| e.kind == EventKind::Log).count();
    assert_eq!(streamed_logs, 2);

    let stored = harness
        .store
        .query_events(&EventFilter::new().with_batch_id(id))
        .unwrap();
    assert_eq!(stored.len(), events.len());
}

#[tokio::test]
async fn test_late_subscriber_gets_no_replay() {
    let harness = TestHarness::new(MockAccountApi::new(), MockOrderSite::new());

    let id = harness
        .controller
        .start(AccountRange::new(1, 3), checkpoint())
        .await
        .unwrap();
    harness.controller.wait(&id).await.unwrap();
    // Let the dispatcher drain the finish event before subscribing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut late = harness.broadcaster.subscribe();
    assert!(late.try_next_event().is_none());

    let status = harness.controller.status(&id).await.unwrap();
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!(status.succeeded, 3);
    assert_eq!(status.progress, 3);
}

#[tokio::test]
async fn test_slow_subscriber_sees_lag_notice() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteRunStore::new(&temp_dir.path().join("runs.db")).unwrap());
    let recorder = Arc::new(ResultRecorder::new(
        Arc::clone(&store) as Arc<dyn RunStore>,
        1,
        Duration::from_millis(1),
    ));
    let broadcaster = EventBroadcaster::new(4);
    let (emitter, dispatcher) = create_event_pipeline(recorder, broadcaster.clone(), 64);
    let handle = tokio::spawn(dispatcher.run());

    let mut slow = broadcaster.subscribe();
    let mut fast = broadcaster.subscribe();
    let batch_id = BatchId::new();
    for i in 0..10 {
        emitter.emit(Event::new(
            batch_id,
            EventLevel::Info,
            EventKind::Log,
            format!("line {}", i),
        ));
        if let Some(event) = fast.next_event().await {
            assert_eq!(event.message, format!("line {}", i));
        }
    }
    drop(emitter);
    handle.await.unwrap();

    match slow.recv().await {
        Some(Received::Lagged(n)) => assert_eq!(n, 6),
        other => panic!("expected lag notice, got {:?}", other),
    }
    let remaining: Vec<_> = std::iter::from_fn(|| slow.try_next_event())
        .map(|e| e.message)
        .collect();
    assert_eq!(remaining, vec!["line 6", "line 7", "line 8", "line 9"]);
    assert_eq!(slow.skipped(), 6);

    // The log is complete even though the subscriber lagged.
    let stored = store
        .count_events(&EventFilter::new().with_batch_id(batch_id))
        .unwrap();
    assert_eq!(stored, 10);
}
