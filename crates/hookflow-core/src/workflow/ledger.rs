//! Step ledger snapshot for one run.
//!
//! `StepLedger` is the in-memory view of a run's step records, loaded once per
//! invocation. It indexes records by step id and by position so the context
//! can both answer "is this step done?" and check that steps are requested in
//! the order they were first recorded.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use hookflow_types::callback::{CallbackPayload, CompletedStep, PendingStep};
use hookflow_types::error::RepositoryError;
use hookflow_types::step::{StepExecution, StepStatus};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct StepLedger {
    /// Records ordered by position.
    steps: Vec<StepExecution>,
    by_id: HashMap<String, usize>,
    by_position: HashMap<u32, usize>,
}

impl StepLedger {
    /// Build the ledger from stored records.
    ///
    /// Two records for one step id, or two steps at one position, mean the
    /// store is corrupt and are refused rather than resolved.
    pub fn from_records(mut records: Vec<StepExecution>) -> Result<Self, RepositoryError> {
        records.sort_by_key(|s| s.position);

        let mut by_id = HashMap::with_capacity(records.len());
        let mut by_position = HashMap::with_capacity(records.len());
        for (idx, step) in records.iter().enumerate() {
            if by_id.insert(step.step_id.clone(), idx).is_some() {
                return Err(RepositoryError::Corruption(format!(
                    "duplicate records for step '{}' in run {}",
                    step.step_id, step.run_id
                )));
            }
            if let Some(other) = by_position.insert(step.position, idx) {
                return Err(RepositoryError::Corruption(format!(
                    "steps '{}' and '{}' share position {} in run {}",
                    records[other].step_id, step.step_id, step.position, step.run_id
                )));
            }
        }

        Ok(Self {
            steps: records,
            by_id,
            by_position,
        })
    }

    pub fn get(&self, step_id: &str) -> Option<&StepExecution> {
        self.by_id.get(step_id).map(|&idx| &self.steps[idx])
    }

    pub fn at_position(&self, position: u32) -> Option<&StepExecution> {
        self.by_position.get(&position).map(|&idx| &self.steps[idx])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepExecution> {
        self.steps.iter()
    }

    /// Completed steps with their results, in position order.
    pub fn completed_steps(&self) -> Vec<CompletedStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| CompletedStep {
                step_id: s.step_id.clone(),
                result: s.result.clone().unwrap_or(serde_json::Value::Null),
            })
            .collect()
    }

    /// The first unresolved step, if any.
    pub fn pending_step(&self) -> Option<PendingStep> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| PendingStep {
                step_id: s.step_id.clone(),
                attempt_count: s.attempt_count,
                not_before: s.next_retry_at,
            })
    }

    /// Payload for the next callback of this run.
    pub fn next_payload(
        &self,
        run_id: Uuid,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> CallbackPayload {
        CallbackPayload {
            run_id,
            workflow_id: workflow_id.to_string(),
            input,
            completed_steps: self.completed_steps(),
            pending_step: self.pending_step(),
        }
    }
}

/// `at + delay`, saturating at the maximum representable time.
pub fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn orders_records_and_indexes_them() {
        let now = Utc::now();
        let run_id = Uuid::now_v7();
        let ledger = StepLedger::from_records(vec![
            StepExecution::pending(run_id, "wait", 1, now, now),
            StepExecution::completed(run_id, "validate", 0, json!(true), now),
        ])
        .unwrap();

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.at_position(0).unwrap().step_id, "validate");
        assert_eq!(ledger.get("wait").unwrap().position, 1);
        assert!(ledger.get("charge").is_none());

        let completed = ledger.completed_steps();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].step_id, "validate");

        let pending = ledger.pending_step().unwrap();
        assert_eq!(pending.step_id, "wait");
        assert_eq!(pending.not_before, Some(now));
    }

    #[test]
    fn duplicate_step_records_are_corruption() {
        let now = Utc::now();
        let run_id = Uuid::now_v7();
        let err = StepLedger::from_records(vec![
            StepExecution::completed(run_id, "validate", 0, json!(true), now),
            StepExecution::completed(run_id, "validate", 1, json!(true), now),
        ])
        .unwrap_err();
        assert!(matches!(err, RepositoryError::Corruption(_)));
    }

    #[test]
    fn shared_position_is_corruption() {
        let now = Utc::now();
        let run_id = Uuid::now_v7();
        let err = StepLedger::from_records(vec![
            StepExecution::completed(run_id, "a", 0, json!(1), now),
            StepExecution::completed(run_id, "b", 0, json!(2), now),
        ])
        .unwrap_err();
        assert!(matches!(err, RepositoryError::Corruption(_)));
    }

    #[test]
    fn after_saturates() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::from_secs(60)), now + TimeDelta::seconds(60));
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
