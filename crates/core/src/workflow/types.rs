use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::OrderConfirmation;
use crate::task::ErrorKind;

/// States of the order workflow.
///
/// `Init -> AddressSelect -> CartPopulate -> Checkout -> Done`, with
/// `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Init,
    AddressSelect,
    CartPopulate,
    Checkout,
    Done,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Failed)
    }

    /// Step attempted in this state.
    pub fn step(&self) -> Option<StepName> {
        match self {
            WorkflowState::Init => Some(StepName::Init),
            WorkflowState::AddressSelect => Some(StepName::AddressSelect),
            WorkflowState::CartPopulate => Some(StepName::CartPopulate),
            WorkflowState::Checkout => Some(StepName::Checkout),
            WorkflowState::Done | WorkflowState::Failed => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Init => "init",
            WorkflowState::AddressSelect => "address_select",
            WorkflowState::CartPopulate => "cart_populate",
            WorkflowState::Checkout => "checkout",
            WorkflowState::Done => "done",
            WorkflowState::Failed => "failed",
        }
    }
}

/// Name of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Init,
    AddressSelect,
    CartPopulate,
    Checkout,
}

impl StepName {
    pub const ALL: [StepName; 4] = [
        StepName::Init,
        StepName::AddressSelect,
        StepName::CartPopulate,
        StepName::Checkout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Init => "init",
            StepName::AddressSelect => "address_select",
            StepName::CartPopulate => "cart_populate",
            StepName::Checkout => "checkout",
        }
    }

    /// State entered once this step succeeds.
    pub fn next_state(&self) -> WorkflowState {
        match self {
            StepName::Init => WorkflowState::AddressSelect,
            StepName::AddressSelect => WorkflowState::CartPopulate,
            StepName::CartPopulate => WorkflowState::Checkout,
            StepName::Checkout => WorkflowState::Done,
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged result of one step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T> {
    Success(T),
    /// Worth another attempt: network error, timeout, flaky page.
    Retryable(String),
    /// Retrying cannot help.
    Terminal(String),
    /// The site no longer accepts the stored session.
    SessionExpired(String),
}

impl<T> StepOutcome<T> {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Success(_) => "success",
            StepOutcome::Retryable(_) => "retryable",
            StepOutcome::Terminal(_) => "terminal",
            StepOutcome::SessionExpired(_) => "session_expired",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            StepOutcome::Success(_) => None,
            StepOutcome::Retryable(m) | StepOutcome::Terminal(m) | StepOutcome::SessionExpired(m) => {
                Some(m)
            }
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepOutcome<U> {
        match self {
            StepOutcome::Success(v) => StepOutcome::Success(f(v)),
            StepOutcome::Retryable(m) => StepOutcome::Retryable(m),
            StepOutcome::Terminal(m) => StepOutcome::Terminal(m),
            StepOutcome::SessionExpired(m) => StepOutcome::SessionExpired(m),
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    5000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy with no delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay after the given failed attempt (1-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Static configuration of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub name: StepName,
    pub retry: RetryPolicy,
}

/// What the retry loop does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Complete,
    RetryAfter(Duration),
    GiveUp(ErrorKind),
}

/// A step that gave up.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{step} failed after {attempts} attempt(s): {message}")]
pub struct WorkflowError {
    pub step: StepName,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
    /// Artifact captured from the session when the step gave up.
    pub diagnostic: Option<String>,
}

/// How a workflow run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowReport {
    pub final_state: WorkflowState,
    pub cart_total: Option<f64>,
    pub confirmation: Option<OrderConfirmation>,
    pub failure: Option<WorkflowError>,
}
