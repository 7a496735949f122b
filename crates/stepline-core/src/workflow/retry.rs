//! Retry and optional-skip policy for failed steps.
//!
//! Stateless: all decisions are associated functions that take the step
//! definition and the attempt number as parameters.

use std::time::Duration;

use stepline_types::error::StepError;

use super::definition::Step;

// ---------------------------------------------------------------------------
// FailureAction
// ---------------------------------------------------------------------------

/// What the executor does after a step returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Hand the job back to the queue for redelivery.
    Retry { delay: Duration },
    /// Retries exhausted on an optional step: continue with the flow.
    Skip,
    /// Retries exhausted on a mandatory step: fail the workflow.
    Fail,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

pub struct RetryHandler;

impl RetryHandler {
    /// Attempt number the policy compares against `max_retries`.
    ///
    /// `args_attempt` is the counter carried in the message; `delivery_attempt`
    /// is the queue's own 1-based delivery count, which advances on every
    /// native redelivery of the same job. The larger of the two wins.
    pub fn effective_attempt(args_attempt: u32, delivery_attempt: u32) -> u32 {
        args_attempt.max(delivery_attempt.saturating_sub(1))
    }

    /// Decide how to handle a failure at zero-based `attempt`.
    ///
    /// A fatal step error skips any remaining retries.
    pub fn decide(step: &Step, attempt: u32, error: &StepError) -> FailureAction {
        if !error.is_fatal() && attempt < step.max_retries {
            FailureAction::Retry {
                delay: step.retry_delay,
            }
        } else if step.is_optional {
            FailureAction::Skip
        } else {
            FailureAction::Fail
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
