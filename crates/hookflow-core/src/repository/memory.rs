//! In-memory `WorkflowStore` implementation.
//!
//! Backs the disabled-persistence mode, where a fresh store is seeded from the
//! callback payload for each invocation and dropped afterwards, and the test
//! suites. All state sits behind one mutex so every method, including
//! `dead_letter_step`, is a single atomic transition.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use hookflow_types::callback::CallbackPayload;
use hookflow_types::dead_letter::DeadLetterEntry;
use hookflow_types::error::RepositoryError;
use hookflow_types::run::{Run, RunError, RunStatus};
use hookflow_types::step::{StepExecution, StepStatus};
use uuid::Uuid;

use super::store::WorkflowStore;

#[derive(Debug, Default)]
struct State {
    runs: HashMap<Uuid, Run>,
    steps: HashMap<(Uuid, String), StepExecution>,
    dead_letters: Vec<DeadLetterEntry>,
}

/// Process-local store with the same transition rules as the SQLite store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the per-invocation store for a run whose only memory is its payload.
    ///
    /// Completed steps take positions in payload order. The pending step, if
    /// any, takes the next position.
    pub fn seeded(payload: &CallbackPayload, now: DateTime<Utc>) -> Result<Self, RepositoryError> {
        let mut state = State::default();

        let mut run = Run::new(payload.run_id, payload.workflow_id.clone(), payload.input.clone(), now);
        run.status = RunStatus::Running;
        state.runs.insert(run.run_id, run);

        let mut position: u32 = 0;
        for completed in &payload.completed_steps {
            let key = (payload.run_id, completed.step_id.clone());
            if state.steps.contains_key(&key) {
                return Err(RepositoryError::Corruption(format!(
                    "step '{}' listed twice in callback payload",
                    completed.step_id
                )));
            }
            let step = StepExecution::completed(
                payload.run_id,
                completed.step_id.clone(),
                position,
                completed.result.clone(),
                now,
            );
            state.steps.insert(key, step);
            position += 1;
        }

        if let Some(pending) = &payload.pending_step {
            let key = (payload.run_id, pending.step_id.clone());
            if !state.steps.contains_key(&key) {
                let step = StepExecution {
                    run_id: payload.run_id,
                    step_id: pending.step_id.clone(),
                    position,
                    status: StepStatus::Pending,
                    result: None,
                    attempt_count: pending.attempt_count,
                    next_retry_at: pending.not_before,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                };
                state.steps.insert(key, step);
            }
        }

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Connection("memory store lock poisoned".to_string()))
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for MemoryStore {
    async fn create_run_if_absent(&self, run: &Run) -> Result<Run, RepositoryError> {
        let mut state = self.state()?;
        Ok(state.runs.entry(run.run_id).or_insert_with(|| run.clone()).clone())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        Ok(self.state()?.runs.get(run_id).cloned())
    }

    async fn mark_running(&self, run_id: &Uuid, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            run.updated_at = now;
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: &Uuid,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        match run.status {
            RunStatus::Completed if run.result.as_ref() == Some(result) => Ok(()),
            status if status.is_terminal() => Err(RepositoryError::Conflict(format!(
                "run {run_id} is already {status}"
            ))),
            _ => {
                run.status = RunStatus::Completed;
                run.result = Some(result.clone());
                run.updated_at = now;
                Ok(())
            }
        }
    }

    async fn fail_run(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: &RunError,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        if !matches!(status, RunStatus::Failed | RunStatus::DeadLettered) {
            return Err(RepositoryError::Conflict(format!(
                "{status} is not a failure status"
            )));
        }
        let mut state = self.state()?;
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status.is_terminal() {
            if run.status == status && run.error.as_ref() == Some(error) {
                return Ok(());
            }
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }
        run.status = status;
        run.error = Some(error.clone());
        run.updated_at = now;
        Ok(())
    }

    async fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: u32,
    ) -> Result<Vec<Run>, RepositoryError> {
        let state = self.state()?;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepExecution>, RepositoryError> {
        let state = self.state()?;
        let mut steps: Vec<StepExecution> = state
            .steps
            .values()
            .filter(|s| s.run_id == *run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }

    async fn get_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        Ok(self.state()?.steps.get(&(*run_id, step_id.to_string())).cloned())
    }

    async fn complete_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let key = (step.run_id, step.step_id.clone());
        match state.steps.get_mut(&key) {
            None => {
                state.steps.insert(key, step.clone());
                Ok(())
            }
            Some(existing) => match existing.status {
                StepStatus::Completed if existing.result == step.result => Ok(()),
                StepStatus::Completed | StepStatus::Failed => Err(RepositoryError::Conflict(
                    format!("step '{}' is already {}", step.step_id, existing.status.as_str()),
                )),
                StepStatus::Pending => {
                    existing.status = StepStatus::Completed;
                    existing.result = step.result.clone();
                    existing.attempt_count = existing.attempt_count.max(step.attempt_count);
                    existing.next_retry_at = None;
                    existing.updated_at = step.updated_at;
                    Ok(())
                }
            },
        }
    }

    async fn insert_pending_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let key = (step.run_id, step.step_id.clone());
        if state.steps.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "step '{}' already recorded",
                step.step_id
            )));
        }
        state.steps.insert(key, step.clone());
        Ok(())
    }

    async fn record_step_failure(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let key = (step.run_id, step.step_id.clone());
        match state.steps.get_mut(&key) {
            None => {
                state.steps.insert(key, step.clone());
                Ok(())
            }
            Some(existing) if existing.status != StepStatus::Pending => {
                Err(RepositoryError::Conflict(format!(
                    "step '{}' is already {}",
                    step.step_id,
                    existing.status.as_str()
                )))
            }
            Some(existing) => {
                existing.attempt_count = existing.attempt_count.max(step.attempt_count);
                existing.next_retry_at = step.next_retry_at;
                existing.last_error = step.last_error.clone();
                existing.updated_at = step.updated_at;
                Ok(())
            }
        }
    }

    async fn dead_letter_step(
        &self,
        step: &StepExecution,
        entry: &DeadLetterEntry,
        run_error: &RunError,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state()?;

        let run = state.runs.get(&step.run_id).ok_or(RepositoryError::NotFound)?;
        if run.status.is_terminal() && run.status != RunStatus::DeadLettered {
            return Err(RepositoryError::Conflict(format!(
                "run {} is already {}",
                step.run_id, run.status
            )));
        }

        let key = (step.run_id, step.step_id.clone());
        match state.steps.get_mut(&key) {
            Some(existing) if existing.status == StepStatus::Completed => {
                return Err(RepositoryError::Conflict(format!(
                    "step '{}' is already completed",
                    step.step_id
                )));
            }
            Some(existing) => {
                existing.status = StepStatus::Failed;
                existing.attempt_count = existing.attempt_count.max(step.attempt_count);
                existing.next_retry_at = None;
                existing.last_error = step.last_error.clone();
                existing.updated_at = step.updated_at;
            }
            None => {
                state.steps.insert(key, step.clone());
            }
        }

        let exists = state
            .dead_letters
            .iter()
            .any(|d| d.run_id == entry.run_id && d.step_id == entry.step_id);
        if !exists {
            state.dead_letters.push(entry.clone());
        }

        if let Some(run) = state.runs.get_mut(&step.run_id) {
            if run.status != RunStatus::DeadLettered {
                run.status = RunStatus::DeadLettered;
                run.error = Some(run_error.clone());
                run.updated_at = step.updated_at;
            }
        }
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        run_id: Option<&Uuid>,
    ) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let state = self.state()?;
        let mut entries: Vec<DeadLetterEntry> = state
            .dead_letters
            .iter()
            .filter(|d| run_id.is_none_or(|id| d.run_id == *id))
            .cloned()
            .collect();
        entries.sort_by_key(|d| d.created_at);
        Ok(entries)
    }

    async fn purge_dead_letters(&self, older_than: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state()?;
        let before = state.dead_letters.len();
        state.dead_letters.retain(|d| d.created_at >= older_than);
        Ok((before - state.dead_letters.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use hookflow_types::callback::{CompletedStep, PendingStep};
    use hookflow_types::run::FailureKind;
    use hookflow_types::step::StepFailure;
    use serde_json::json;

    fn sample_run(now: DateTime<Utc>) -> Run {
        Run::new(Uuid::now_v7(), "order", json!({"order_id": "12345"}), now)
    }

    fn failure(now: DateTime<Utc>) -> StepFailure {
        StepFailure {
            kind: FailureKind::Transient,
            message: "gateway timeout".to_string(),
            occurred_at: now,
        }
    }

    #[tokio::test]
    async fn create_run_if_absent_keeps_first_record() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let run = sample_run(now);

        let stored = store.create_run_if_absent(&run).await.unwrap();
        assert_eq!(stored, run);

        let mut other = run.clone();
        other.input = json!({"order_id": "other"});
        let stored = store.create_run_if_absent(&other).await.unwrap();
        assert_eq!(stored.input, json!({"order_id": "12345"}));
    }

    #[tokio::test]
    async fn complete_run_is_write_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let run = sample_run(now);
        store.create_run_if_absent(&run).await.unwrap();

        store.complete_run(&run.run_id, &json!(1), now).await.unwrap();
        store.complete_run(&run.run_id, &json!(1), now).await.unwrap();
        let err = store.complete_run(&run.run_id, &json!(2), now).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let err = store
            .fail_run(&run.run_id, RunStatus::Failed, &RunError::workflow("late"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn complete_step_is_write_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let run_id = Uuid::now_v7();

        let step = StepExecution::completed(run_id, "validate", 0, json!(true), now);
        store.complete_step(&step).await.unwrap();
        store.complete_step(&step).await.unwrap();

        let changed = StepExecution::completed(run_id, "validate", 0, json!(false), now);
        let err = store.complete_step(&changed).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let stored = store.get_step(&run_id, "validate").await.unwrap().unwrap();
        assert_eq!(stored.result, Some(json!(true)));
    }

    #[tokio::test]
    async fn record_step_failure_never_lowers_attempt_count() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let run_id = Uuid::now_v7();

        let mut step = StepExecution::pending(run_id, "charge", 2, now, now);
        step.attempt_count = 2;
        step.last_error = Some(failure(now));
        store.record_step_failure(&step).await.unwrap();

        step.attempt_count = 1;
        store.record_step_failure(&step).await.unwrap();

        let stored = store.get_step(&run_id, "charge").await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
    }

    #[tokio::test]
    async fn dead_letter_step_updates_step_run_and_entry_together() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let run = sample_run(now);
        store.create_run_if_absent(&run).await.unwrap();

        let mut step = StepExecution::pending(run.run_id, "charge", 0, now, now);
        step.status = StepStatus::Failed;
        step.next_retry_at = None;
        step.attempt_count = 3;
        step.last_error = Some(failure(now));

        let entry = DeadLetterEntry {
            run_id: run.run_id,
            step_id: "charge".to_string(),
            workflow_id: "order".to_string(),
            payload: run.input.clone(),
            error: failure(now),
            failure_count: 3,
            created_at: now,
        };
        let run_error = RunError {
            kind: FailureKind::Transient,
            message: "gateway timeout".to_string(),
            step_id: Some("charge".to_string()),
            attempts: 3,
        };

        store.dead_letter_step(&step, &entry, &run_error).await.unwrap();
        store.dead_letter_step(&step, &entry, &run_error).await.unwrap();

        let stored_run = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored_run.status, RunStatus::DeadLettered);
        assert_eq!(stored_run.error, Some(run_error));

        let stored_step = store.get_step(&run.run_id, "charge").await.unwrap().unwrap();
        assert_eq!(stored_step.status, StepStatus::Failed);

        let entries = store.list_dead_letters(Some(&run.run_id)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_count, 3);
    }

    #[tokio::test]
    async fn purge_removes_only_old_entries() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (step_id, age_days) in [("old", 30), ("new", 1)] {
            let entry = DeadLetterEntry {
                run_id: Uuid::now_v7(),
                step_id: step_id.to_string(),
                workflow_id: "order".to_string(),
                payload: json!({}),
                error: failure(now),
                failure_count: 3,
                created_at: now - TimeDelta::days(age_days),
            };
            store.state().unwrap().dead_letters.push(entry);
        }

        let removed = store
            .purge_dead_letters(now - TimeDelta::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = store.list_dead_letters(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].step_id, "new");
    }

    #[tokio::test]
    async fn seeded_store_orders_payload_steps() {
        let now = Utc::now();
        let wake = now + TimeDelta::seconds(60);
        let payload = CallbackPayload {
            run_id: Uuid::now_v7(),
            workflow_id: "order".to_string(),
            input: json!({"order_id": "12345"}),
            completed_steps: vec![CompletedStep {
                step_id: "validate".to_string(),
                result: json!(true),
            }],
            pending_step: Some(PendingStep {
                step_id: "wait".to_string(),
                attempt_count: 0,
                not_before: Some(wake),
            }),
        };

        let store = MemoryStore::seeded(&payload, now).unwrap();
        let steps = store.list_steps(&payload.run_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_id, "validate");
        assert_eq!(steps[0].position, 0);
        assert_eq!(steps[1].step_id, "wait");
        assert_eq!(steps[1].position, 1);
        assert_eq!(steps[1].next_retry_at, Some(wake));

        let run = store.get_run(&payload.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn seeded_store_rejects_duplicate_steps() {
        let step = CompletedStep {
            step_id: "validate".to_string(),
            result: json!(true),
        };
        let payload = CallbackPayload {
            run_id: Uuid::now_v7(),
            workflow_id: "order".to_string(),
            input: json!({}),
            completed_steps: vec![step.clone(), step],
            pending_step: None,
        };
        let err = MemoryStore::seeded(&payload, Utc::now()).unwrap_err();
        assert!(matches!(err, RepositoryError::Corruption(_)));
    }
}
