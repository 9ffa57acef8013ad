//! Retry/backoff controller for failed steps.
//!
//! `RetryPolicy` is pure: exponential backoff without jitter, so a given
//! attempt count always maps to the same delay. `RetryController` applies a
//! policy decision to the store: either a pending record with a retry time,
//! or the atomic dead-letter transition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hookflow_types::config::RetryConfig;
use hookflow_types::dead_letter::DeadLetterEntry;
use hookflow_types::error::RepositoryError;
use hookflow_types::run::{FailureKind, Run, RunError};
use hookflow_types::step::{StepExecution, StepFailure, StepStatus};

use crate::repository::store::WorkflowStore;

use super::ledger::after;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// What happens to a step after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave the step pending and retry after the delay.
    ScheduleRetry(Duration),
    /// Give up: dead-letter the step and the run.
    DeadLetter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed):
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Decide after `attempt_count` failed attempts.
    ///
    /// A non-retryable failure, or the failure of attempt `max_attempts`,
    /// dead-letters the step.
    pub fn decide(&self, attempt_count: u32, retryable: bool) -> RetryDecision {
        if !retryable || attempt_count >= self.max_attempts {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::ScheduleRetry(self.backoff(attempt_count))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

// ---------------------------------------------------------------------------
// RetryController
// ---------------------------------------------------------------------------

/// A step attempt that just failed.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedStep {
    pub step_id: String,
    pub position: u32,
    /// Failed attempts recorded before this one.
    pub prior_attempts: u32,
    pub failure: StepFailure,
}

impl FailedStep {
    /// Attempt count including this failure.
    pub fn attempt_count(&self) -> u32 {
        self.prior_attempts.saturating_add(1)
    }

    fn is_retryable(&self) -> bool {
        matches!(self.failure.kind, FailureKind::Transient | FailureKind::Timeout)
    }
}

/// Applies retry decisions to a store.
pub struct RetryController<'a, S> {
    store: &'a S,
    policy: &'a RetryPolicy,
}

impl<'a, S: WorkflowStore> RetryController<'a, S> {
    pub fn new(store: &'a S, policy: &'a RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Count the failed attempt, decide, and persist the decision.
    pub async fn on_step_failure(
        &self,
        run: &Run,
        failed: &FailedStep,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, RepositoryError> {
        let attempt_count = failed.attempt_count();
        let decision = self.policy.decide(attempt_count, failed.is_retryable());

        let mut step = StepExecution {
            run_id: run.run_id,
            step_id: failed.step_id.clone(),
            position: failed.position,
            status: StepStatus::Pending,
            result: None,
            attempt_count,
            next_retry_at: None,
            last_error: Some(failed.failure.clone()),
            created_at: now,
            updated_at: now,
        };

        match decision {
            RetryDecision::ScheduleRetry(delay) => {
                step.next_retry_at = Some(after(now, delay));
                self.store.record_step_failure(&step).await?;
                tracing::info!(
                    run_id = %run.run_id,
                    step_id = %failed.step_id,
                    attempt = attempt_count,
                    delay_secs = delay.as_secs(),
                    error = %failed.failure.message,
                    "Step failed, retry scheduled"
                );
            }
            RetryDecision::DeadLetter => {
                step.status = StepStatus::Failed;
                let entry = DeadLetterEntry {
                    run_id: run.run_id,
                    step_id: failed.step_id.clone(),
                    workflow_id: run.workflow_id.clone(),
                    payload: run.input.clone(),
                    error: failed.failure.clone(),
                    failure_count: attempt_count,
                    created_at: now,
                };
                let run_error = RunError {
                    kind: failed.failure.kind,
                    message: failed.failure.message.clone(),
                    step_id: Some(failed.step_id.clone()),
                    attempts: attempt_count,
                };
                self.store.dead_letter_step(&step, &entry, &run_error).await?;
                tracing::error!(
                    run_id = %run.run_id,
                    step_id = %failed.step_id,
                    workflow = %run.workflow_id,
                    attempt = attempt_count,
                    error = %failed.failure.message,
                    "Step dead-lettered"
                );
            }
        }

        Ok(decision)
    }
}
