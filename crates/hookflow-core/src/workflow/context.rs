//! The step context handed to workflow functions.
//!
//! `WorkflowContext` never touches the store. It answers step requests from a
//! ledger snapshot and records at most one "halt" per invocation: the single
//! unit of progress (a completed step, a started sleep, a failed attempt) or
//! the reason to wait. The executor persists the halt once the workflow
//! function has returned. After a halt every further step request returns
//! `Interrupt::Suspend` without running anything.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hookflow_types::run::{FailureKind, RunError};
use hookflow_types::step::{StepExecution, StepFailure, StepStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::error::{EngineError, Interrupt, StepError, StepResult};
use super::ledger::{StepLedger, after};
use super::outbound::{OutboundClient, OutboundRequest, OutboundResponse};
use super::retry::FailedStep;

// ---------------------------------------------------------------------------
// Halt
// ---------------------------------------------------------------------------

/// What the invocation stopped on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Halt {
    /// A step ran successfully. The record must be persisted as completed.
    Completed(StepExecution),
    /// A durable sleep was requested for the first time.
    SleepStarted(StepExecution),
    /// A sleep or retry is recorded but not yet due. Nothing to write.
    Waiting {
        step_id: String,
        not_before: DateTime<Utc>,
        attempt: u32,
    },
    /// A step attempt failed and goes to the retry controller.
    Failed(FailedStep),
}

/// The step action running when the invocation was cut short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InFlight {
    pub step_id: String,
    pub position: u32,
    pub prior_attempts: u32,
}

/// Everything the executor needs from a finished context.
#[derive(Debug)]
pub(crate) struct Interception {
    pub halt: Option<Halt>,
    /// Sleeps found elapsed during this invocation, already marked completed.
    pub elapsed_sleeps: Vec<StepExecution>,
    pub in_flight: Option<InFlight>,
}

enum Lookup {
    Recorded(StepExecution),
    New(u32),
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

pub struct WorkflowContext {
    run_id: Uuid,
    ledger: StepLedger,
    now: DateTime<Utc>,
    outbound: Arc<dyn OutboundClient>,
    /// Position the next requested step takes.
    cursor: u32,
    seen: HashSet<String>,
    halt: Option<Halt>,
    elapsed_sleeps: Vec<StepExecution>,
    in_flight: Option<InFlight>,
}

impl WorkflowContext {
    pub(crate) fn new(
        run_id: Uuid,
        ledger: StepLedger,
        now: DateTime<Utc>,
        outbound: Arc<dyn OutboundClient>,
    ) -> Self {
        Self {
            run_id,
            ledger,
            now,
            outbound,
            cursor: 0,
            seen: HashSet::new(),
            halt: None,
            elapsed_sleeps: Vec::new(),
            in_flight: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Time at which this invocation started. Differs between invocations, so
    /// workflow code must not branch on it outside of a step.
    pub fn invoked_at(&self) -> DateTime<Utc> {
        self.now
    }

    /// Key for making a step's external side effect idempotent, stable across
    /// retries of the same step.
    pub fn idempotency_key(&self, step_id: &str) -> String {
        format!("{}-{step_id}", self.run_id)
    }

    /// Run `action` once for the lifetime of the run.
    ///
    /// A completed step returns its recorded result. Otherwise the action is
    /// invoked: success records the result and suspends, failure goes to the
    /// retry controller. A retry that is not yet due suspends without
    /// invoking the action.
    pub async fn run<T, F, Fut>(&mut self, step_id: &str, action: F) -> StepResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StepError>> + Send,
    {
        let (position, prior_attempts) = match self.begin(step_id)? {
            Lookup::New(position) => (position, 0),
            Lookup::Recorded(record) => match record.status {
                StepStatus::Completed => {
                    tracing::debug!(run_id = %self.run_id, step_id, "Replaying completed step");
                    return decode(step_id, record.result);
                }
                StepStatus::Failed => return Err(Interrupt::Failed(failed_step_error(&record))),
                StepStatus::Pending => match record.next_retry_at {
                    Some(retry_at) if retry_at > self.now => {
                        tracing::debug!(
                            run_id = %self.run_id,
                            step_id,
                            retry_at = %retry_at,
                            "Retry not yet due"
                        );
                        self.halt = Some(Halt::Waiting {
                            step_id: step_id.to_string(),
                            not_before: retry_at,
                            attempt: record.attempt_count.max(1),
                        });
                        return Err(Interrupt::Suspend);
                    }
                    _ => (record.position, record.attempt_count),
                },
            },
        };

        self.in_flight = Some(InFlight {
            step_id: step_id.to_string(),
            position,
            prior_attempts,
        });
        let outcome = action().await;
        self.in_flight = None;

        match outcome {
            Ok(value) => {
                let result = serde_json::to_value(&value).map_err(|e| {
                    EngineError::Serialization(format!("step '{step_id}' result: {e}"))
                })?;
                let mut record =
                    StepExecution::completed(self.run_id, step_id, position, result, self.now);
                record.attempt_count = prior_attempts;
                tracing::info!(
                    run_id = %self.run_id,
                    step_id,
                    attempt = prior_attempts + 1,
                    "Step completed"
                );
                self.halt = Some(Halt::Completed(record));
            }
            Err(err) => {
                let kind = if err.is_retryable() {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                };
                tracing::warn!(
                    run_id = %self.run_id,
                    step_id,
                    attempt = prior_attempts + 1,
                    error = %err,
                    "Step attempt failed"
                );
                self.halt = Some(Halt::Failed(FailedStep {
                    step_id: step_id.to_string(),
                    position,
                    prior_attempts,
                    failure: StepFailure {
                        kind,
                        message: err.message().to_string(),
                        occurred_at: self.now,
                    },
                }));
            }
        }
        Err(Interrupt::Suspend)
    }

    /// Durable sleep: suspend until `duration` after the first request.
    ///
    /// Never blocks. The wake time is recorded on first request; later
    /// invocations continue once it has passed and re-suspend on the same
    /// wake time before that.
    pub fn sleep(&mut self, step_id: &str, duration: Duration) -> StepResult<()> {
        match self.begin(step_id)? {
            Lookup::New(position) => {
                let wake_at = after(self.now, duration);
                tracing::info!(run_id = %self.run_id, step_id, wake_at = %wake_at, "Sleep started");
                self.halt = Some(Halt::SleepStarted(StepExecution::pending(
                    self.run_id,
                    step_id,
                    position,
                    wake_at,
                    self.now,
                )));
                Err(Interrupt::Suspend)
            }
            Lookup::Recorded(record) => match record.status {
                StepStatus::Completed => Ok(()),
                StepStatus::Failed => Err(Interrupt::Failed(failed_step_error(&record))),
                StepStatus::Pending => match record.next_retry_at {
                    Some(wake_at) if wake_at > self.now => {
                        self.halt = Some(Halt::Waiting {
                            step_id: step_id.to_string(),
                            not_before: wake_at,
                            attempt: record.attempt_count.max(1),
                        });
                        Err(Interrupt::Suspend)
                    }
                    _ => {
                        tracing::debug!(run_id = %self.run_id, step_id, "Sleep elapsed");
                        let mut done = record;
                        done.status = StepStatus::Completed;
                        done.result = Some(serde_json::Value::Null);
                        done.next_retry_at = None;
                        done.updated_at = self.now;
                        self.elapsed_sleeps.push(done);
                        Ok(())
                    }
                },
            },
        }
    }

    /// Perform an outbound HTTP request once, recording the response.
    ///
    /// Transport failures are transient step errors. HTTP error statuses are
    /// returned as responses.
    pub async fn call(
        &mut self,
        step_id: &str,
        request: OutboundRequest,
    ) -> StepResult<OutboundResponse> {
        let client = Arc::clone(&self.outbound);
        self.run(step_id, move || async move {
            client.send(request).await.map_err(StepError::from)
        })
        .await
    }

    /// Claim the next position for `step_id` and look it up.
    fn begin(&mut self, step_id: &str) -> StepResult<Lookup> {
        if self.halt.is_some() {
            return Err(Interrupt::Suspend);
        }
        if !self.seen.insert(step_id.to_string()) {
            return Err(EngineError::DeterminismViolation(format!(
                "step '{step_id}' requested twice in one invocation of run {}",
                self.run_id
            ))
            .into());
        }

        let position = self.cursor;
        self.cursor += 1;

        match self.ledger.get(step_id) {
            Some(record) if record.position != position => {
                Err(EngineError::DeterminismViolation(format!(
                    "step '{step_id}' requested at position {position} but recorded at position {} in run {}",
                    record.position, self.run_id
                ))
                .into())
            }
            Some(record) => Ok(Lookup::Recorded(record.clone())),
            None => match self.ledger.at_position(position) {
                Some(owner) => Err(EngineError::DeterminismViolation(format!(
                    "step '{step_id}' requested at position {position}, which run {} recorded for step '{}'",
                    self.run_id, owner.step_id
                ))
                .into()),
                None => Ok(Lookup::New(position)),
            },
        }
    }

    pub(crate) fn finish(self) -> Interception {
        Interception {
            halt: self.halt,
            elapsed_sleeps: self.elapsed_sleeps,
            in_flight: self.in_flight,
        }
    }
}

fn decode<T: DeserializeOwned>(step_id: &str, result: Option<serde_json::Value>) -> StepResult<T> {
    serde_json::from_value(result.unwrap_or(serde_json::Value::Null)).map_err(|e| {
        EngineError::Serialization(format!(
            "recorded result of step '{step_id}' does not match the requested type: {e}"
        ))
        .into()
    })
}

fn failed_step_error(record: &StepExecution) -> RunError {
    let (kind, message) = match &record.last_error {
        Some(failure) => (failure.kind, failure.message.clone()),
        None => (FailureKind::Permanent, "step failed".to_string()),
    };
    RunError {
        kind,
        message,
        step_id: Some(record.step_id.clone()),
        attempts: record.attempt_count,
    }
}
