//! Batch controller: start, stop, status.
//!
//! Each started batch gets its own scheduler task that feeds a FIFO queue
//! through a [`ConcurrencyLimiter`]. The queue starts with the first
//! repetition of every account; a task's next repetition is queued only
//! after it finishes, so one account never has two sessions at once.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::config::validate_batch;
use super::{
    AccountRange, Batch, BatchConfig, BatchError, BatchHandle, BatchId, BatchRegistry,
    BatchStatus, EngineConfig, StopAck, TaskConfig, TaskResult,
};
use crate::driver::{
    AccountApi, AccountDriver, CheckpointDriver, OrderDriver, OrderSite, TaskContext,
};
use crate::events::{EventEmitter, EventKind, EventLevel, EventScope};
use crate::limiter::{Admission, ConcurrencyLimiter, Slot};
use crate::metrics;
use crate::recorder::ResultRecorder;
use crate::store::AccountStore;
use crate::task::{ErrorKind, Outcome, Task, TaskId};
use crate::workflow::{StepRunner, WorkflowConfig};

/// External collaborators the drivers are built from.
///
/// A mode whose backend is missing rejects start requests.
#[derive(Clone)]
pub struct DriverBackends {
    pub account_api: Option<Arc<dyn AccountApi>>,
    pub order_site: Option<Arc<dyn OrderSite>>,
    pub workflow: WorkflowConfig,
    /// Default pause between checkpoint accounts.
    pub checkpoint_delay: Duration,
}

impl DriverBackends {
    pub fn new(workflow: WorkflowConfig) -> Self {
        Self {
            account_api: None,
            order_site: None,
            workflow,
            checkpoint_delay: Duration::ZERO,
        }
    }

    pub fn with_account_api(mut self, api: Arc<dyn AccountApi>) -> Self {
        self.account_api = Some(api);
        self
    }

    pub fn with_order_site(mut self, site: Arc<dyn OrderSite>) -> Self {
        self.order_site = Some(site);
        self
    }

    pub fn with_checkpoint_delay(mut self, delay: Duration) -> Self {
        self.checkpoint_delay = delay;
        self
    }
}

/// Starts, stops and reports on batches.
pub struct BatchController {
    config: EngineConfig,
    registry: Arc<BatchRegistry>,
    recorder: Arc<ResultRecorder>,
    accounts: Arc<dyn AccountStore>,
    emitter: EventEmitter,
    backends: DriverBackends,
}

impl BatchController {
    pub fn new(
        config: EngineConfig,
        recorder: Arc<ResultRecorder>,
        accounts: Arc<dyn AccountStore>,
        emitter: EventEmitter,
        backends: DriverBackends,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(BatchRegistry::new()),
            recorder,
            accounts,
            emitter,
            backends,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BatchRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<ResultRecorder> {
        &self.recorder
    }

    /// Validate and start a batch.
    ///
    /// Every validation failure is returned before any task exists. On
    /// success the batch is already running when this returns.
    pub async fn start(
        &self,
        range: AccountRange,
        config: BatchConfig,
    ) -> Result<BatchId, BatchError> {
        let prepared = validate_batch(range, &config, &self.config)
            .and_then(|validated| Ok((validated, self.build_driver(&config.task)?)));
        let (validated, driver) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                metrics::BATCHES_REJECTED.inc();
                warn!(range = %range, error = %e, "Rejected batch start");
                return Err(e);
            }
        };

        let mode = config.mode();
        let handle = Arc::new(BatchHandle::new(
            validated.range,
            validated.repetition_count,
            validated.concurrency_limit,
            mode,
        ));
        let batch_id = handle.id();
        self.registry.insert(Arc::clone(&handle)).await;

        if !self.recorder.save_batch(&handle).await {
            handle.set_error("batch persistence degraded");
        }
        if !self.recorder.save_tasks(&handle.tasks()).await {
            handle.set_error("task persistence degraded");
        }

        let events = self.emitter.for_batch(batch_id);
        events.emit(
            events
                .event(
                    EventLevel::Info,
                    EventKind::BatchStarted,
                    format!(
                        "Started {} batch for accounts {} ({} task(s), concurrency {})",
                        mode.as_str(),
                        validated.range,
                        validated.total_tasks,
                        validated.concurrency_limit
                    ),
                )
                .with_metadata(json!({
                    "mode": mode.as_str(),
                    "range_start": validated.range.start,
                    "range_end": validated.range.end,
                    "repetition_count": validated.repetition_count,
                    "concurrency_limit": validated.concurrency_limit,
                    "total_tasks": validated.total_tasks,
                })),
        );
        metrics::BATCHES_STARTED
            .with_label_values(&[mode.as_str()])
            .inc();
        info!(
            batch_id = %batch_id,
            mode = mode.as_str(),
            tasks = validated.total_tasks,
            concurrency = validated.concurrency_limit,
            "Batch started"
        );

        let scheduler = Arc::new(Scheduler {
            limiter: ConcurrencyLimiter::new(validated.concurrency_limit),
            batch: handle,
            driver,
            recorder: Arc::clone(&self.recorder),
            accounts: Arc::clone(&self.accounts),
            events,
            task_timeout: Duration::from_secs(self.config.task_timeout_secs),
        });
        tokio::spawn(scheduler.run());

        Ok(batch_id)
    }

    fn build_driver(&self, task: &TaskConfig) -> Result<Arc<dyn AccountDriver>, BatchError> {
        match task {
            TaskConfig::Checkpoint(checkpoint) => {
                let api = self.backends.account_api.clone().ok_or_else(|| {
                    BatchError::Validation("checkpoint mode is not configured".to_string())
                })?;
                let delay = checkpoint
                    .inter_account_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.backends.checkpoint_delay);
                Ok(Arc::new(CheckpointDriver::new(api, delay)))
            }
            TaskConfig::Order(order) => {
                let site = self.backends.order_site.clone().ok_or_else(|| {
                    BatchError::Validation("order mode is not configured".to_string())
                })?;
                let plan = order.resolve(self.accounts.as_ref())?;
                let runner = StepRunner::from_config(&self.backends.workflow);
                Ok(Arc::new(OrderDriver::new(site, plan, runner)))
            }
        }
    }

    /// Request a cooperative stop.
    ///
    /// No pending task starts afterwards; running tasks finish normally.
    /// Stopping a batch twice, or one that already finished, is acknowledged
    /// without effect.
    pub async fn stop(&self, id: &BatchId) -> Result<StopAck, BatchError> {
        let handle = self
            .registry
            .get(id)
            .await
            .ok_or(BatchError::NotFound(*id))?;

        let transition = handle.request_stop();
        if transition.newly_requested {
            let counters = handle.counters();
            let events = self.emitter.for_batch(*id);
            events.emit(
                events
                    .event(
                        EventLevel::Warn,
                        EventKind::BatchStopRequested,
                        format!(
                            "Stop requested: {} running task(s) will finish, {} pending task(s) will not start",
                            counters.running, counters.pending
                        ),
                    )
                    .with_metadata(json!({
                        "running": counters.running,
                        "pending": counters.pending,
                    })),
            );
            info!(batch_id = %id, running = counters.running, pending = counters.pending, "Stop requested");

            match transition.finished {
                Some(finished) => {
                    announce_finished(&self.recorder, &handle, &events, &finished).await
                }
                None => {
                    if !self.recorder.save_batch(&handle).await {
                        handle.set_error("batch persistence degraded");
                    }
                }
            }
        }

        Ok(StopAck {
            acknowledged: true,
            already_stopping: !transition.newly_requested,
        })
    }

    /// Stop every running batch. Returns how many were newly stopped.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for handle in self.registry.running().await {
            match self.stop(&handle.id()).await {
                Ok(ack) if !ack.already_stopping => stopped += 1,
                Ok(_) => {}
                Err(e) => warn!(batch_id = %handle.id(), error = %e, "Failed to stop batch"),
            }
        }
        stopped
    }

    /// Current status, from memory or from the store for older batches.
    pub async fn status(&self, id: &BatchId) -> Result<BatchStatus, BatchError> {
        if let Some(handle) = self.registry.get(id).await {
            return Ok(handle.status());
        }
        let batch = self
            .recorder
            .store()
            .load_batch(id)?
            .ok_or(BatchError::NotFound(*id))?;
        Ok(BatchStatus::from_batch(&batch, None))
    }

    /// Finished task outcomes in creation order.
    pub async fn results(&self, id: &BatchId) -> Result<Vec<TaskResult>, BatchError> {
        if let Some(handle) = self.registry.get(id).await {
            return Ok(handle.results());
        }
        let store = self.recorder.store();
        if store.load_batch(id)?.is_none() {
            return Err(BatchError::NotFound(*id));
        }
        Ok(store
            .list_tasks(id)?
            .iter()
            .filter(|t| t.status.is_terminal())
            .map(TaskResult::from)
            .collect())
    }

    /// Status of every batch started by this process, newest first.
    pub async fn list(&self) -> Vec<BatchStatus> {
        self.registry
            .list()
            .await
            .iter()
            .map(|handle| handle.status())
            .collect()
    }

    /// Wait until the batch is terminal and return its final status.
    pub async fn wait(&self, id: &BatchId) -> Result<BatchStatus, BatchError> {
        let handle = self
            .registry
            .get(id)
            .await
            .ok_or(BatchError::NotFound(*id))?;
        handle.wait_finished().await;
        Ok(handle.status())
    }
}

/// Per-batch scheduling state shared by the scheduler loop and its workers.
struct Scheduler {
    batch: Arc<BatchHandle>,
    limiter: ConcurrencyLimiter,
    driver: Arc<dyn AccountDriver>,
    recorder: Arc<ResultRecorder>,
    accounts: Arc<dyn AccountStore>,
    events: EventScope,
    task_timeout: Duration,
}

impl Scheduler {
    async fn run(self: Arc<Self>) {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<TaskId>();
        for task_id in self.batch.first_repetitions() {
            let _ = queue_tx.send(task_id);
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.batch.wait_finished() => break,
                next = queue_rx.recv() => next,
            };
            let Some(task_id) = next else { break };

            match self.limiter.admit(&self.batch, task_id).await {
                Admission::Admitted(slot, task) => {
                    let worker = Arc::clone(&self);
                    let queue = queue_tx.clone();
                    tokio::spawn(async move { worker.run_task(slot, task, queue).await });
                }
                Admission::Cancelled => {
                    debug!(batch_id = %self.batch.id(), "Admission cancelled by stop");
                    break;
                }
                Admission::Rejected(reason) => {
                    warn!(batch_id = %self.batch.id(), task_id = %task_id, ?reason, "Task not admitted");
                }
            }
        }

        self.limiter.close();
        debug!(batch_id = %self.batch.id(), "Scheduler exited");
    }

    async fn run_task(
        self: Arc<Self>,
        slot: Slot,
        task: Task,
        queue: mpsc::UnboundedSender<TaskId>,
    ) {
        let mode = self.batch.mode().as_str();
        let events = self.events.for_task(task.id);
        events.emit(
            events
                .event(
                    EventLevel::Info,
                    EventKind::TaskStarted,
                    format!(
                        "Account {} repetition {} started",
                        task.account_id,
                        task.repetition + 1
                    ),
                )
                .with_metadata(json!({
                    "account_id": task.account_id,
                    "repetition": task.repetition,
                })),
        );
        metrics::TASKS_STARTED.with_label_values(&[mode]).inc();

        let started = Instant::now();
        let outcome = self.execute(&task, &events).await;
        metrics::TASK_DURATION
            .with_label_values(&[mode])
            .observe(started.elapsed().as_secs_f64());

        // Published before recording so it precedes any batch_finished it triggers
        events.emit(task_finished_event(&events, &task, &outcome));
        let completion = match self.recorder.record(&self.batch, task.id, &outcome).await {
            Ok(completion) => completion,
            Err(e) => {
                error!(batch_id = %self.batch.id(), task_id = %task.id, error = %e, "Failed to record outcome");
                return;
            }
        };

        let label = match outcome.error_kind() {
            None => "succeeded",
            Some(kind) => kind.as_str(),
        };
        metrics::TASKS_FINISHED.with_label_values(&[mode, label]).inc();

        // Free the slot before the batch can be reported finished
        drop(slot);

        match completion.finished {
            Some(finished) => {
                announce_finished(&self.recorder, &self.batch, &self.events, &finished).await
            }
            None if !self.batch.is_stop_requested() => {
                if let Some(next) = self.batch.next_repetition(task.id) {
                    let _ = queue.send(next);
                }
            }
            None => {}
        }
    }

    /// Run the driver with the credential, a timeout and panic isolation.
    /// Every failure comes back as a failed outcome.
    async fn execute(&self, task: &Task, events: &EventScope) -> Outcome {
        let credential = match self.accounts.load_credential(task.account_id) {
            Ok(Some(credential)) if credential.has_session() => credential,
            Ok(Some(_)) => {
                return Outcome::failed(
                    ErrorKind::MissingCredential,
                    format!("account {} has no session material", task.account_id),
                )
            }
            Ok(None) => {
                return Outcome::failed(
                    ErrorKind::MissingCredential,
                    format!("no credential stored for account {}", task.account_id),
                )
            }
            Err(e) => {
                return Outcome::failed(
                    ErrorKind::Persistence,
                    format!("could not load credential: {}", e),
                )
            }
        };

        let ctx = TaskContext {
            batch_id: task.batch_id,
            task_id: task.id,
            account_id: task.account_id,
            repetition: task.repetition,
            credential,
            events: events.clone(),
        };

        let run = AssertUnwindSafe(self.driver.run(&ctx)).catch_unwind();
        match tokio::time::timeout(self.task_timeout, run).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %task.id, account_id = task.account_id, "Driver panicked: {}", message);
                Outcome::failed(
                    ErrorKind::InternalFault,
                    format!("driver panicked: {}", message),
                )
            }
            Err(_) => {
                warn!(task_id = %task.id, account_id = task.account_id, "Task timed out");
                Outcome::failed(
                    ErrorKind::Timeout,
                    format!("task timed out after {}s", self.task_timeout.as_secs_f64()),
                )
            }
        }
    }
}

fn task_finished_event(events: &EventScope, task: &Task, outcome: &Outcome) -> crate::events::Event {
    let metadata = json!({
        "account_id": task.account_id,
        "repetition": task.repetition,
        "status": outcome.status,
        "payload": outcome.payload,
        "error": outcome.error,
    });
    match &outcome.error {
        None => events
            .event(
                EventLevel::Info,
                EventKind::TaskSucceeded,
                format!("Account {} succeeded", task.account_id),
            )
            .with_metadata(metadata),
        Some(error) => {
            let event = events.event(
                EventLevel::Error,
                EventKind::TaskFailed,
                format!(
                    "Account {} failed ({}): {}",
                    task.account_id,
                    error.kind.as_str(),
                    error.message
                ),
            );
            let event = match &error.step {
                Some(step) => event.with_step(step.clone()),
                None => event,
            };
            event.with_metadata(metadata)
        }
    }
}

/// Summary event, metrics and final snapshot for a batch that just went terminal.
async fn announce_finished(
    recorder: &ResultRecorder,
    handle: &BatchHandle,
    events: &EventScope,
    batch: &Batch,
) {
    let counters = &batch.counters;
    events.emit(
        events
            .event(
                EventLevel::Info,
                EventKind::BatchFinished,
                format!(
                    "Batch {}: {} succeeded, {} failed, {} not run",
                    batch.state.as_str(),
                    counters.succeeded,
                    counters.failed,
                    counters.pending
                ),
            )
            .with_metadata(json!({
                "state": batch.state.as_str(),
                "succeeded": counters.succeeded,
                "failed": counters.failed,
                "pending": counters.pending,
                "total_points": batch.total_points,
            })),
    );
    metrics::BATCHES_FINISHED
        .with_label_values(&[batch.mode.as_str(), batch.state.as_str()])
        .inc();
    info!(
        batch_id = %batch.id,
        state = batch.state.as_str(),
        succeeded = counters.succeeded,
        failed = counters.failed,
        "Batch finished"
    );

    if !recorder.save_batch(handle).await {
        handle.set_error("batch persistence degraded");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
