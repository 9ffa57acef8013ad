//! Workflow store trait definition.
//!
//! Defines the storage interface for runs, the step ledger and dead letters.
//! The infrastructure layer (hookflow-infra) implements this trait with SQLite
//! persistence; `MemoryStore` implements it in-process.

use chrono::{DateTime, Utc};
use hookflow_types::dead_letter::DeadLetterEntry;
use hookflow_types::error::RepositoryError;
use hookflow_types::run::{Run, RunError, RunStatus};
use hookflow_types::step::StepExecution;
use uuid::Uuid;

/// Repository trait for durable run state.
///
/// Covers three entity families:
/// - **Runs:** create, transition and query run records.
/// - **Steps:** the per-run step ledger, keyed uniquely by `(run_id, step_id)`.
/// - **Dead letters:** permanently failed steps kept for manual recovery.
///
/// Every method is a single atomic state transition. Write-once fields
/// (`Run::result`, `StepExecution::result`) reject a second, different value
/// with `RepositoryError::Conflict`; rewriting the identical value is a no-op.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert `run` unless a run with the same id exists. Returns the stored run.
    fn create_run_if_absent(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<Run, RepositoryError>> + Send;

    /// Get a run by its id.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    /// Move a `pending` run to `running`. A run already running is left as is.
    fn mark_running(
        &self,
        run_id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Transition a run to `completed` with its result.
    fn complete_run(
        &self,
        run_id: &Uuid,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Transition a run to `failed` or `dead_lettered` with its error.
    fn fail_run(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: &RunError,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List runs in the given status, oldest first.
    fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// All step records of a run, ordered by position.
    fn list_steps(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    /// Look up one step. More than one record for the pair is `Corruption`.
    fn get_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// Record `step` as completed, inserting it or resolving its pending record.
    fn complete_step(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Insert a new pending step (a durable sleep). An existing record is a `Conflict`.
    fn insert_pending_step(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Upsert the pending record of a failed attempt.
    ///
    /// `attempt_count` never decreases: the stored value becomes the maximum
    /// of the stored and supplied counts. A completed step is never touched.
    fn record_step_failure(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    /// Atomically write `entry`, mark `step` failed and move the run to
    /// `dead_lettered` with `run_error`.
    fn dead_letter_step(
        &self,
        step: &StepExecution,
        entry: &DeadLetterEntry,
        run_error: &RunError,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List dead letters, optionally for a single run, oldest first.
    fn list_dead_letters(
        &self,
        run_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<DeadLetterEntry>, RepositoryError>> + Send;

    /// Delete dead letters created before `older_than`. Returns the number removed.
    fn purge_dead_letters(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
