//! Workflow run records.
//!
//! A `Run` is one execution instance of a registered workflow. Its `result`
//! and `error` fields are write-once and mutually exclusive: a run ends either
//! `Completed` with a result or `Failed`/`DeadLettered` with an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    DeadLettered,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::DeadLettered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "dead_lettered" => Ok(RunStatus::DeadLettered),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunError
// ---------------------------------------------------------------------------

/// Why a run or step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Eligible for retry with backoff.
    Transient,
    /// Never retried.
    Permanent,
    /// The invocation ran past its execution timeout.
    Timeout,
    /// Raised by workflow code itself rather than by a step action.
    Workflow,
}

/// Structured failure description stored on a terminal run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: FailureKind,
    pub message: String,
    /// Step that caused the failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Failed attempts recorded for that step.
    #[serde(default)]
    pub attempts: u32,
}

impl RunError {
    pub fn workflow(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Workflow,
            message: message.into(),
            step_id: None,
            attempts: 0,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step_id {
            Some(step_id) => write!(
                f,
                "step '{step_id}' failed after {} attempt(s): {}",
                self.attempts, self.message
            ),
            None => f.write_str(&self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution instance of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// UUIDv7 generated at trigger time.
    pub run_id: Uuid,
    /// Name of the registered workflow function.
    pub workflow_id: String,
    pub status: RunStatus,
    /// Immutable after creation.
    pub input: serde_json::Value,
    /// Set once, only when `status == Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Set once, only when `status` is `Failed` or `DeadLettered`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// A freshly triggered run in `Pending` status.
    pub fn new(
        run_id: Uuid,
        workflow_id: impl Into<String>,
        input: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            input,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_status_serializes_snake_case() {
        let s = serde_json::to_value(RunStatus::DeadLettered).unwrap();
        assert_eq!(s, json!("dead_lettered"));
        assert_eq!("dead_lettered".parse::<RunStatus>().unwrap(), RunStatus::DeadLettered);
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::DeadLettered.is_terminal());
    }

    #[test]
    fn new_run_is_pending_without_result_or_error() {
        let run = Run::new(Uuid::now_v7(), "order", json!({"order_id": "12345"}), Utc::now());
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.result.is_none());
        assert!(run.error.is_none());
        assert_eq!(run.created_at, run.updated_at);
    }

    #[test]
    fn run_error_display_mentions_step() {
        let err = RunError {
            kind: FailureKind::Transient,
            message: "gateway timeout".to_string(),
            step_id: Some("charge".to_string()),
            attempts: 3,
        };
        let text = err.to_string();
        assert!(text.contains("charge"));
        assert!(text.contains("3 attempt"));
        assert!(text.contains("gateway timeout"));

        assert_eq!(RunError::workflow("bad input").to_string(), "bad input");
    }
}
