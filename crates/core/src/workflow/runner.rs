//! Drives one order session through the workflow steps.

use std::time::Duration;

use serde_json::json;
use tracing::debug;

use super::{
    next_action, RetryDecision, StepName, StepOutcome, WorkflowConfig, WorkflowError,
    WorkflowReport, WorkflowState, WorkflowStep,
};
use crate::driver::{CartSummary, OrderConfirmation, OrderPlan, OrderSession};
use crate::events::{EventKind, EventLevel, EventScope};
use crate::metrics;
use crate::task::ErrorKind;

/// What a successful step hands back to the runner.
enum StepOutput {
    Done,
    Cart(CartSummary),
    Order(OrderConfirmation),
}

/// Runs the workflow steps in order, each under its retry policy.
#[derive(Debug, Clone)]
pub struct StepRunner {
    steps: Vec<WorkflowStep>,
    call_timeout: Duration,
}

impl StepRunner {
    pub fn new(steps: Vec<WorkflowStep>, call_timeout: Duration) -> Self {
        Self {
            steps,
            call_timeout,
        }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self::new(config.steps(), config.call_timeout())
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    fn step(&self, name: StepName) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Run the session from `Init` until `Done` or `Failed`.
    ///
    /// Any step that gives up fails the workflow with that step's name;
    /// later steps never run.
    pub async fn run(
        &self,
        session: &mut dyn OrderSession,
        plan: &OrderPlan,
        events: &EventScope,
    ) -> WorkflowReport {
        let mut report = WorkflowReport {
            final_state: WorkflowState::Init,
            cart_total: None,
            confirmation: None,
            failure: None,
        };

        let mut state = WorkflowState::Init;
        while let Some(name) = state.step() {
            let result = match self.step(name) {
                Some(step) => self.run_step(step, session, plan, events).await,
                None => Err(WorkflowError {
                    step: name,
                    kind: ErrorKind::InternalFault,
                    message: format!("{} is not configured", name),
                    attempts: 0,
                    diagnostic: None,
                }),
            };

            match result {
                Ok(output) => {
                    match output {
                        StepOutput::Cart(cart) => report.cart_total = Some(cart.total),
                        StepOutput::Order(confirmation) => {
                            report.confirmation = Some(confirmation)
                        }
                        StepOutput::Done => {}
                    }
                    state = name.next_state();
                }
                Err(failure) => {
                    report.failure = Some(failure);
                    state = WorkflowState::Failed;
                }
            }
        }

        report.final_state = state;
        report
    }

    async fn run_step(
        &self,
        step: &WorkflowStep,
        session: &mut dyn OrderSession,
        plan: &OrderPlan,
        events: &EventScope,
    ) -> Result<StepOutput, WorkflowError> {
        let name = step.name;
        events.emit(
            events
                .event(EventLevel::Info, EventKind::StepStarted, format!("{} started", name))
                .with_step(name.as_str())
                .with_metadata(json!({ "max_attempts": step.retry.max_attempts })),
        );

        let mut attempt = 0;
        let mut failure_reported = false;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(
                self.call_timeout,
                attempt_step(name, session, plan),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::Retryable(format!(
                    "{} timed out after {}s",
                    name,
                    self.call_timeout.as_secs()
                )),
            };

            metrics::STEP_ATTEMPTS
                .with_label_values(&[name.as_str(), outcome.label()])
                .inc();

            match next_action(&step.retry, attempt, &outcome) {
                RetryDecision::Complete => {
                    events.emit(
                        events
                            .event(
                                EventLevel::Info,
                                EventKind::StepSucceeded,
                                format!("{} succeeded", name),
                            )
                            .with_step(name.as_str())
                            .with_metadata(json!({ "attempts": attempt })),
                    );
                    return match outcome {
                        StepOutcome::Success(output) => Ok(output),
                        _ => Ok(StepOutput::Done),
                    };
                }
                RetryDecision::RetryAfter(delay) => {
                    let message = outcome.error_message().unwrap_or_default().to_string();
                    if !failure_reported {
                        events.emit(
                            events
                                .event(
                                    EventLevel::Warn,
                                    EventKind::StepFailed,
                                    format!("{} failed, retrying: {}", name, message),
                                )
                                .with_step(name.as_str())
                                .with_metadata(json!({
                                    "attempt": attempt,
                                    "max_attempts": step.retry.max_attempts,
                                    "retry_in_ms": delay.as_millis() as u64,
                                })),
                        );
                        failure_reported = true;
                    } else {
                        debug!(step = %name, attempt, error = %message, "Step attempt failed");
                    }
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp(kind) => {
                    let message = outcome.error_message().unwrap_or_default().to_string();
                    let diagnostic = session.capture_diagnostics(name.as_str()).await;
                    events.emit(
                        events
                            .event(
                                EventLevel::Error,
                                EventKind::StepGaveUp,
                                format!("{} gave up after {} attempt(s): {}", name, attempt, message),
                            )
                            .with_step(name.as_str())
                            .with_metadata(json!({
                                "attempts": attempt,
                                "error_kind": kind.as_str(),
                                "diagnostic": diagnostic,
                            })),
                    );
                    return Err(WorkflowError {
                        step: name,
                        kind,
                        message,
                        attempts: attempt,
                        diagnostic,
                    });
                }
            }
        }
    }
}

/// One attempt of one step against the session.
async fn attempt_step(
    name: StepName,
    session: &mut dyn OrderSession,
    plan: &OrderPlan,
) -> StepOutcome<StepOutput> {
    match name {
        StepName::Init => session.authenticate().await.map(|_| StepOutput::Done),
        StepName::AddressSelect => session
            .select_address(&plan.address)
            .await
            .map(|_| StepOutput::Done),
        StepName::CartPopulate => match session.populate_cart(&plan.lines).await {
            StepOutcome::Success(cart) => match plan.check_cart(cart.total) {
                Ok(()) => StepOutcome::Success(StepOutput::Cart(cart)),
                Err(reason) => StepOutcome::Terminal(reason),
            },
            other => other.map(StepOutput::Cart),
        },
        StepName::Checkout => session
            .checkout(&plan.payment)
            .await
            .map(StepOutput::Order),
    }
}
