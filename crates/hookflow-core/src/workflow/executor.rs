//! Replay executor: one invocation of a workflow function against the ledger.
//!
//! # Execution flow
//!
//! 1. Create the run record on first sight, or load it.
//! 2. Terminal runs return their stored result or error without running.
//! 3. Load the step ledger and run the workflow function from the top, under
//!    the execution timeout.
//! 4. Persist sleeps that were found elapsed, then the single halt the
//!    context recorded (completed step, started sleep, failed attempt).
//! 5. Map the result to an `Outcome`. A function that returns without
//!    halting completes the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hookflow_types::run::{FailureKind, Run, RunError, RunStatus};
use hookflow_types::step::StepFailure;
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::repository::store::WorkflowStore;

use super::context::{Halt, InFlight, WorkflowContext};
use super::error::{EngineError, Interrupt};
use super::ledger::{StepLedger, after};
use super::outbound::OutboundClient;
use super::registry::Workflow;
use super::retry::{FailedStep, RetryController, RetryDecision, RetryPolicy};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// When the next invocation may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingHint {
    /// Progress was made; continue right away.
    Immediate,
    /// Retry or wake time; do not invoke earlier.
    NotBefore(DateTime<Utc>),
}

impl SchedulingHint {
    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        match self {
            SchedulingHint::Immediate => None,
            SchedulingHint::NotBefore(at) => Some(*at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspension {
    /// Step the invocation stopped on.
    pub step_id: String,
    pub hint: SchedulingHint,
    /// Attempt of `step_id` this suspension follows, for deduplication.
    pub attempt: u32,
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Suspended(Suspension),
    Completed(Value),
    Failed(RunError),
}

// ---------------------------------------------------------------------------
// ReplayExecutor
// ---------------------------------------------------------------------------

/// How the workflow function ended, once aborts are handled.
enum Returned {
    TimedOut,
    Value(Value),
    Failed(RunError),
    Suspended,
}

pub struct ReplayExecutor {
    policy: RetryPolicy,
    outbound: Arc<dyn OutboundClient>,
    clock: Arc<dyn Clock>,
    execution_timeout: Option<Duration>,
}

impl ReplayExecutor {
    pub fn new(
        policy: RetryPolicy,
        outbound: Arc<dyn OutboundClient>,
        clock: Arc<dyn Clock>,
        execution_timeout: Option<Duration>,
    ) -> Self {
        Self {
            policy,
            outbound,
            clock,
            execution_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one invocation of `workflow` for `run_id`.
    ///
    /// Completed steps come from `store`; `input` is only used when the run
    /// is seen for the first time.
    pub async fn execute<S: WorkflowStore>(
        &self,
        store: &S,
        run_id: Uuid,
        workflow: &dyn Workflow,
        input: Value,
    ) -> Result<Outcome, EngineError> {
        let now = self.clock.now();
        let mut run = store
            .create_run_if_absent(&Run::new(run_id, workflow.name(), input, now))
            .await?;

        if run.workflow_id != workflow.name() {
            return Err(EngineError::WorkflowMismatch {
                stored: run.workflow_id,
                requested: workflow.name().to_string(),
            });
        }

        match run.status {
            RunStatus::Completed => {
                tracing::debug!(run_id = %run_id, "Run already completed");
                return Ok(Outcome::Completed(run.result.unwrap_or(Value::Null)));
            }
            RunStatus::Failed | RunStatus::DeadLettered => {
                tracing::debug!(run_id = %run_id, status = %run.status, "Run already failed");
                return Ok(Outcome::Failed(run.error.unwrap_or_else(|| {
                    RunError::workflow(format!("run ended {} without a recorded error", run.status))
                })));
            }
            RunStatus::Pending => {
                store.mark_running(&run_id, now).await?;
                run.status = RunStatus::Running;
            }
            RunStatus::Running => {}
        }

        let ledger = StepLedger::from_records(store.list_steps(&run_id).await?)?;
        let mut ctx = WorkflowContext::new(run_id, ledger, now, Arc::clone(&self.outbound));

        let returned = match self.execution_timeout {
            Some(limit) => {
                tokio::time::timeout(limit, workflow.run(&mut ctx, run.input.clone()))
                    .await
                    .ok()
            }
            None => Some(workflow.run(&mut ctx, run.input.clone()).await),
        };
        let interception = ctx.finish();

        let returned = match returned {
            None => Returned::TimedOut,
            Some(Ok(result)) => Returned::Value(result),
            Some(Err(Interrupt::Failed(error))) => Returned::Failed(error),
            Some(Err(Interrupt::Suspend)) => Returned::Suspended,
            Some(Err(Interrupt::Abort(err))) => {
                tracing::error!(run_id = %run_id, error = %err, "Invocation aborted");
                return Err(err);
            }
        };

        for sleep in &interception.elapsed_sleeps {
            store.complete_step(sleep).await?;
        }

        // A recorded halt takes precedence over whatever the function returned.
        if let Some(halt) = interception.halt {
            return self.apply_halt(store, &run, halt, now).await;
        }

        match returned {
            Returned::TimedOut => self.on_timeout(store, &run, interception.in_flight, now).await,
            Returned::Value(result) => {
                store.complete_run(&run_id, &result, now).await?;
                tracing::info!(run_id = %run_id, workflow = %run.workflow_id, "Run completed");
                Ok(Outcome::Completed(result))
            }
            Returned::Failed(error) => {
                store.fail_run(&run_id, RunStatus::Failed, &error, now).await?;
                tracing::warn!(run_id = %run_id, error = %error, "Run failed");
                Ok(Outcome::Failed(error))
            }
            Returned::Suspended => Err(EngineError::Contract(
                "workflow returned Interrupt::Suspend without a suspended step".to_string(),
            )),
        }
    }

    async fn apply_halt<S: WorkflowStore>(
        &self,
        store: &S,
        run: &Run,
        halt: Halt,
        now: DateTime<Utc>,
    ) -> Result<Outcome, EngineError> {
        match halt {
            Halt::Completed(step) => {
                store.complete_step(&step).await?;
                Ok(Outcome::Suspended(Suspension {
                    attempt: step.attempt_count + 1,
                    step_id: step.step_id,
                    hint: SchedulingHint::Immediate,
                }))
            }
            Halt::SleepStarted(step) => {
                store.insert_pending_step(&step).await?;
                let wake_at = step.next_retry_at.unwrap_or(now);
                Ok(Outcome::Suspended(Suspension {
                    step_id: step.step_id,
                    hint: SchedulingHint::NotBefore(wake_at),
                    attempt: 1,
                }))
            }
            Halt::Waiting {
                step_id,
                not_before,
                attempt,
            } => Ok(Outcome::Suspended(Suspension {
                step_id,
                hint: SchedulingHint::NotBefore(not_before),
                attempt,
            })),
            Halt::Failed(failed) => self.on_step_failure(store, run, failed, now).await,
        }
    }

    async fn on_step_failure<S: WorkflowStore>(
        &self,
        store: &S,
        run: &Run,
        failed: FailedStep,
        now: DateTime<Utc>,
    ) -> Result<Outcome, EngineError> {
        let controller = RetryController::new(store, &self.policy);
        let attempt = failed.attempt_count();
        match controller.on_step_failure(run, &failed, now).await? {
            RetryDecision::ScheduleRetry(delay) => Ok(Outcome::Suspended(Suspension {
                step_id: failed.step_id,
                hint: SchedulingHint::NotBefore(after(now, delay)),
                attempt,
            })),
            RetryDecision::DeadLetter => Ok(Outcome::Failed(RunError {
                kind: failed.failure.kind,
                message: failed.failure.message,
                step_id: Some(failed.step_id),
                attempts: attempt,
            })),
        }
    }

    async fn on_timeout<S: WorkflowStore>(
        &self,
        store: &S,
        run: &Run,
        in_flight: Option<InFlight>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, EngineError> {
        let limit = self.execution_timeout.unwrap_or_default();
        let Some(step) = in_flight else {
            tracing::error!(run_id = %run.run_id, timeout = ?limit, "Invocation timed out outside a step");
            return Err(EngineError::ExecutionTimeout(limit));
        };

        tracing::warn!(
            run_id = %run.run_id,
            step_id = %step.step_id,
            timeout = ?limit,
            "Step timed out"
        );
        let failed = FailedStep {
            step_id: step.step_id,
            position: step.position,
            prior_attempts: step.prior_attempts,
            failure: StepFailure {
                kind: FailureKind::Timeout,
                message: format!("execution timed out after {}s", limit.as_secs()),
                occurred_at: now,
            },
        };
        self.on_step_failure(store, run, failed, now).await
    }
}
