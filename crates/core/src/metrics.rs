//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Batches (started, finished by terminal state)
//! - Tasks (started, finished by outcome, duration)
//! - Workflow steps (attempts by result)
//! - Event pipeline (published, dropped, subscriber lag)
//! - Persistence (failed writes by path)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Batch Metrics
// =============================================================================

/// Batches started by mode.
pub static BATCHES_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cartpilot_batches_started_total", "Total batches started"),
        &["mode"], // "order", "checkpoint"
    )
    .unwrap()
});

/// Batches reaching a terminal state.
pub static BATCHES_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cartpilot_batches_finished_total", "Total batches finished"),
        &["mode", "state"], // state: "completed", "stopped"
    )
    .unwrap()
});

/// Start requests rejected before any task was created.
pub static BATCHES_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "cartpilot_batches_rejected_total",
        "Total start requests rejected by validation",
    )
    .unwrap()
});

// =============================================================================
// Task Metrics
// =============================================================================

pub static TASKS_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cartpilot_tasks_started_total", "Total tasks admitted"),
        &["mode"],
    )
    .unwrap()
});

/// Tasks finished by mode and outcome.
pub static TASKS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cartpilot_tasks_finished_total", "Total tasks finished"),
        &["mode", "outcome"], // outcome: "succeeded" or an error kind
    )
    .unwrap()
});

/// Task wall-clock duration in seconds.
pub static TASK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("cartpilot_task_duration_seconds", "Duration of one task")
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
        &["mode"],
    )
    .unwrap()
});

// =============================================================================
// Workflow Metrics
// =============================================================================

/// Step attempts by step and result.
pub static STEP_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cartpilot_step_attempts_total", "Total workflow step attempts"),
        &["step", "result"], // result: "success", "retryable", "terminal", "session_expired", "timeout"
    )
    .unwrap()
});

// =============================================================================
// Event Metrics
// =============================================================================

pub static EVENTS_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "cartpilot_events_published_total",
        "Total events published to subscribers",
    )
    .unwrap()
});

/// Events dropped because the dispatcher channel was full or closed.
pub static EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "cartpilot_events_dropped_total",
        "Total events dropped before dispatch",
    )
    .unwrap()
});

/// Events lost by slow subscribers.
pub static SUBSCRIBER_LAGGED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "cartpilot_subscriber_lagged_events_total",
        "Total events skipped by lagging subscribers",
    )
    .unwrap()
});

// =============================================================================
// Persistence Metrics
// =============================================================================

pub static PERSISTENCE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cartpilot_persistence_failures_total",
            "Total failed store writes",
        ),
        &["path"], // "task", "batch", "event"
    )
    .unwrap()
});

// =============================================================================
// External Service Metrics
// =============================================================================

/// Account API requests by result.
pub static ACCOUNT_API_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cartpilot_account_api_requests_total",
            "Total account API requests",
        ),
        &["result"], // "success", "session_expired", "error"
    )
    .unwrap()
});

/// Account API request duration in seconds.
pub static ACCOUNT_API_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "cartpilot_account_api_duration_seconds",
            "Duration of account API requests",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0]),
        &[],
    )
    .unwrap()
});

/// Get all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Batches
        Box::new(BATCHES_STARTED.clone()),
        Box::new(BATCHES_FINISHED.clone()),
        Box::new(BATCHES_REJECTED.clone()),
        // Tasks
        Box::new(TASKS_STARTED.clone()),
        Box::new(TASKS_FINISHED.clone()),
        Box::new(TASK_DURATION.clone()),
        // Workflow
        Box::new(STEP_ATTEMPTS.clone()),
        // Events
        Box::new(EVENTS_PUBLISHED.clone()),
        Box::new(EVENTS_DROPPED.clone()),
        Box::new(SUBSCRIBER_LAGGED.clone()),
        // Persistence
        Box::new(PERSISTENCE_FAILURES.clone()),
        // External services
        Box::new(ACCOUNT_API_REQUESTS.clone()),
        Box::new(ACCOUNT_API_DURATION.clone()),
    ]
}
