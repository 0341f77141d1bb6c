//! Core engine for bulk order placement and loyalty point checking.
//!
//! A batch fans one task per (account, repetition) out onto a bounded worker
//! pool. Each task runs an [`AccountDriver`]; order tasks walk the step
//! workflow, checkpoint tasks make a single account request. Terminal outcomes
//! flow through the [`ResultRecorder`], progress events through the
//! [`EventEmitter`] to the [`EventBroadcaster`].

pub mod batch;
pub mod config;
pub mod driver;
pub mod events;
pub mod limiter;
pub mod metrics;
pub mod recorder;
pub mod store;
pub mod task;
pub mod testing;
pub mod workflow;

pub use batch::{
    AccountRange, Batch, BatchConfig, BatchController, BatchCounters, BatchError, BatchHandle,
    BatchId, BatchMode, BatchRegistry, BatchState, BatchStatus, CheckpointTaskConfig,
    DriverBackends, EngineConfig, OrderItem, OrderTaskConfig, PaymentMethod, StopAck, TaskConfig,
    TaskResult, ValidatedBatch,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use driver::{
    AccountApi, AccountDriver, AccountSnapshot, CartSummary, CheckpointConfig, CheckpointDriver,
    DriverError, HttpAccountApi, HttpOrderSite, OrderConfirmation, OrderDriver, OrderEndpoints,
    OrderLine, OrderPlan, OrderSession, OrderSite, OrderSiteConfig, PaymentInstruction,
    TaskContext,
};
pub use events::{
    create_event_pipeline, Event, EventBroadcaster, EventDispatcher, EventEmitter, EventKind,
    EventLevel, EventScope, EventSubscription, Received,
};
pub use limiter::{Admission, ConcurrencyLimiter, Slot};
pub use recorder::{RecordError, ResultRecorder, WritePath};
pub use store::{
    AccountCredential, AccountStore, Address, Card, EventFilter, Product, RunStore,
    SessionCookie, SqliteAccountStore, SqliteRunStore, StoreError,
};
pub use task::{ErrorKind, Outcome, OutcomeStatus, Task, TaskError, TaskId, TaskPayload, TaskStatus};
pub use workflow::{
    next_action, RetryDecision, RetryPolicy, StepName, StepOutcome, StepRunner, WorkflowConfig,
    WorkflowError, WorkflowReport, WorkflowState, WorkflowStep,
};
