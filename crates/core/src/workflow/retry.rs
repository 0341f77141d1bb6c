use super::{RetryDecision, RetryPolicy, StepOutcome};
use crate::task::ErrorKind;

/// Decide what follows an attempt.
///
/// `attempt` is the 1-based number of the attempt that produced `outcome`.
/// Pure: no clock, no I/O.
pub fn next_action<T>(policy: &RetryPolicy, attempt: u32, outcome: &StepOutcome<T>) -> RetryDecision {
    match outcome {
        StepOutcome::Success(_) => RetryDecision::Complete,
        StepOutcome::SessionExpired(_) => RetryDecision::GiveUp(ErrorKind::SessionExpired),
        StepOutcome::Terminal(_) => RetryDecision::GiveUp(ErrorKind::Rejected),
        StepOutcome::Retryable(_) if attempt < policy.max_attempts => {
            RetryDecision::RetryAfter(policy.delay_for(attempt))
        }
        StepOutcome::Retryable(_) => RetryDecision::GiveUp(ErrorKind::TransientExternal),
    }
}
