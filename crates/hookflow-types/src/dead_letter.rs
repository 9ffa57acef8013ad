//! Dead-letter records for permanently failed steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::StepFailure;

/// A step that exhausted its retries (or failed permanently).
///
/// Written once when the step is dead-lettered and never modified. It refers
/// to its run and step by identifier only; removing it is a manual operation
/// (or the retention purge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub run_id: Uuid,
    pub step_id: String,
    pub workflow_id: String,
    /// Run input at the time of failure, kept for manual re-trigger.
    pub payload: serde_json::Value,
    pub error: StepFailure,
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
}
