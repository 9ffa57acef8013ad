//! Step ledger records.
//!
//! A `StepExecution` is the durable record of one caller-identified step
//! within a run. Once `Completed`, its `result` is immutable and is what every
//! later replay of the run receives instead of re-running the step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::FailureKind;

/// Status of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet resolved: waiting for a retry or a durable-sleep wake time.
    Pending,
    Completed,
    /// Permanently failed (dead-lettered).
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// Structured description of a failed step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Durable record of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub run_id: Uuid,
    /// Caller-assigned, unique within a run.
    pub step_id: String,
    /// Ordinal at which the workflow first requested this step.
    pub position: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failed attempts so far. Never decreases.
    pub attempt_count: u32,
    /// Retry time after a transient failure, or wake time of a durable sleep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepExecution {
    /// A completed record carrying `result`.
    pub fn completed(
        run_id: Uuid,
        step_id: impl Into<String>,
        position: u32,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            position,
            status: StepStatus::Completed,
            result: Some(result),
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A pending record that must not be resolved before `not_before`.
    pub fn pending(
        run_id: Uuid,
        step_id: impl Into<String>,
        position: u32,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            position,
            status: StepStatus::Pending,
            result: None,
            attempt_count: 0,
            next_retry_at: Some(not_before),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}
