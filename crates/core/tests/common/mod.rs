//! Shared harness for engine integration tests.

#![allow(dead_code)]

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cartpilot_core::{
    create_event_pipeline, testing::fixtures, testing::MockAccountApi, testing::MockOrderSite,
    AccountApi, BatchController, BatchId, DriverBackends, EngineConfig, Event, EventBroadcaster,
    EventKind, EventSubscription, OrderSite, ResultRecorder, RetryPolicy, RunStore,
    SqliteRunStore, WorkflowConfig,
};

/// Engine wired to mocks, a temp database and a live event pipeline.
pub struct TestHarness {
    pub controller: BatchController,
    pub broadcaster: EventBroadcaster,
    pub store: Arc<SqliteRunStore>,
    pub api: Arc<MockAccountApi>,
    pub site: Arc<MockOrderSite>,
    _temp_dir: TempDir,
}

impl TestHarness {
    pub fn new(api: MockAccountApi, site: MockOrderSite) -> Self {
        Self::with_engine(api, site, EngineConfig::default(), 1..=20)
    }

    pub fn with_engine(
        api: MockAccountApi,
        site: MockOrderSite,
        engine: EngineConfig,
        accounts: RangeInclusive<u64>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteRunStore::new(&temp_dir.path().join("runs.db"))
                .expect("Failed to create run store"),
        );
        let recorder = Arc::new(ResultRecorder::new(
            Arc::clone(&store) as Arc<dyn RunStore>,
            engine.persistence_retries,
            Duration::from_millis(1),
        ));

        let broadcaster = EventBroadcaster::new(1024);
        let (emitter, dispatcher) =
            create_event_pipeline(Arc::clone(&recorder), broadcaster.clone(), 1024);
        tokio::spawn(dispatcher.run());

        let api = Arc::new(api);
        let site = Arc::new(site);
        let backends = DriverBackends::new(fast_workflow(3))
            .with_account_api(Arc::clone(&api) as Arc<dyn AccountApi>)
            .with_order_site(Arc::clone(&site) as Arc<dyn OrderSite>);

        let controller = BatchController::new(
            engine,
            recorder,
            Arc::new(fixtures::account_store(accounts)),
            emitter,
            backends,
        );

        Self {
            controller,
            broadcaster,
            store,
            api,
            site,
            _temp_dir: temp_dir,
        }
    }
}

/// Workflow whose steps retry without delay.
pub fn fast_workflow(max_attempts: u32) -> WorkflowConfig {
    let mut workflow = WorkflowConfig::default();
    workflow.call_timeout_secs = 5;
    workflow.init.retry = RetryPolicy::immediate(max_attempts);
    workflow.address_select.retry = RetryPolicy::immediate(max_attempts);
    workflow.cart_populate.retry = RetryPolicy::immediate(max_attempts);
    workflow.checkout.retry = RetryPolicy::immediate(max_attempts);
    workflow
}

/// Read events until the batch reports it finished.
pub async fn collect_until_finished(
    subscription: &mut EventSubscription,
    batch_id: BatchId,
) -> Vec<Event> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = subscription.next_event().await {
            let done = event.batch_id == batch_id && event.kind == EventKind::BatchFinished;
            events.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("batch did not finish in time");
    events
}
