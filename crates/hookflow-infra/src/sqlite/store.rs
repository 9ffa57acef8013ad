//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `hookflow-core` using sqlx with split
//! read/write pools. JSON values (run input and result, step results, error
//! descriptions) are stored as TEXT. Every transition that must check the
//! current state before writing runs in a transaction on the writer pool.

use chrono::{DateTime, SecondsFormat, Utc};
use hookflow_core::repository::store::WorkflowStore;
use hookflow_types::dead_letter::DeadLetterEntry;
use hookflow_types::error::RepositoryError;
use hookflow_types::run::{Run, RunError, RunStatus};
use hookflow_types::step::{StepExecution, StepFailure, StepStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    run_id: String,
    workflow_id: String,
    status: String,
    input: String,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<Run, RepositoryError> {
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Corruption)?;
        Ok(Run {
            run_id: parse_uuid(&self.run_id)?,
            workflow_id: self.workflow_id,
            status,
            input: parse_json(&self.input, "run input")?,
            result: self
                .result
                .as_deref()
                .map(|s| parse_json(s, "run result"))
                .transpose()?,
            error: self
                .error
                .as_deref()
                .map(|s| parse_json(s, "run error"))
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    run_id: String,
    step_id: String,
    position: i64,
    status: String,
    result: Option<String>,
    attempt_count: i64,
    next_retry_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            position: row.try_get("position")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            attempt_count: row.try_get("attempt_count")?,
            next_retry_at: row.try_get("next_retry_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_step(self) -> Result<StepExecution, RepositoryError> {
        let status: StepStatus = self.status.parse().map_err(RepositoryError::Corruption)?;
        Ok(StepExecution {
            run_id: parse_uuid(&self.run_id)?,
            position: parse_u32(self.position, "position")?,
            status,
            result: self
                .result
                .as_deref()
                .map(|s| parse_json(s, "step result"))
                .transpose()?,
            attempt_count: parse_u32(self.attempt_count, "attempt_count")?,
            next_retry_at: self
                .next_retry_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            last_error: self
                .last_error
                .as_deref()
                .map(|s| parse_json::<StepFailure>(s, "step error"))
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            step_id: self.step_id,
        })
    }
}

struct DeadLetterRow {
    run_id: String,
    step_id: String,
    workflow_id: String,
    payload: String,
    error: String,
    failure_count: i64,
    created_at: String,
}

impl DeadLetterRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            workflow_id: row.try_get("workflow_id")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            failure_count: row.try_get("failure_count")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<DeadLetterEntry, RepositoryError> {
        Ok(DeadLetterEntry {
            run_id: parse_uuid(&self.run_id)?,
            step_id: self.step_id,
            workflow_id: self.workflow_id,
            payload: parse_json(&self.payload, "dead letter payload")?,
            error: parse_json(&self.error, "dead letter error")?,
            failure_count: parse_u32(self.failure_count, "failure_count")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Corruption(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corruption(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps, so TEXT comparison orders them correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Corruption(format!("invalid {what}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn parse_u32(value: i64, what: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Corruption(format!("invalid {what}: {value}")))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Unique-index violations are write conflicts; anything else is a query error.
fn write_err(e: sqlx::Error, conflict: impl FnOnce() -> String) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(conflict())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn decode_step(row: &SqliteRow) -> Result<StepExecution, RepositoryError> {
    StepRow::from_row(row).map_err(query_err)?.into_step()
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn create_run_if_absent(&self, run: &Run) -> Result<Run, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO runs (run_id, workflow_id, status, input, result, error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO NOTHING"#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow_id)
        .bind(run.status.as_str())
        .bind(to_json(&run.input)?)
        .bind(run.result.as_ref().map(to_json).transpose()?)
        .bind(run.error.as_ref().map(to_json).transpose()?)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run.run_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(query_err)?;
        let stored = RunRow::from_row(&row).map_err(query_err)?.into_run()?;

        tx.commit().await.map_err(query_err)?;
        Ok(stored)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn mark_running(&self, run_id: &Uuid, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'running', updated_at = ? WHERE run_id = ? AND status = 'pending'",
        )
        .bind(format_datetime(&now))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM runs WHERE run_id = ?")
                .bind(run_id.to_string())
                .fetch_optional(&self.pool.writer)
                .await
                .map_err(query_err)?;
            if exists.is_none() {
                return Err(RepositoryError::NotFound);
            }
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: &Uuid,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;
        let run = RunRow::from_row(&row).map_err(query_err)?.into_run()?;

        match run.status {
            RunStatus::Completed if run.result.as_ref() == Some(result) => return Ok(()),
            status if status.is_terminal() => {
                return Err(RepositoryError::Conflict(format!(
                    "run {run_id} is already {status}"
                )));
            }
            _ => {}
        }

        sqlx::query(
            "UPDATE runs SET status = 'completed', result = ?, updated_at = ? WHERE run_id = ?",
        )
        .bind(to_json(result)?)
        .bind(format_datetime(&now))
        .bind(run_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
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

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;
        let run = RunRow::from_row(&row).map_err(query_err)?.into_run()?;

        if run.status.is_terminal() {
            if run.status == status && run.error.as_ref() == Some(error) {
                return Ok(());
            }
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }

        sqlx::query("UPDATE runs SET status = ?, error = ?, updated_at = ? WHERE run_id = ?")
            .bind(status.as_str())
            .bind(to_json(error)?)
            .bind(format_datetime(&now))
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: u32,
    ) -> Result<Vec<Run>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE status = ? ORDER BY created_at ASC, run_id ASC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(query_err)?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE run_id = ? ORDER BY position ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(decode_step).collect()
    }

    async fn get_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM step_executions WHERE run_id = ? AND step_id = ?")
            .bind(run_id.to_string())
            .bind(step_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(decode_step(row)?)),
            _ => Err(RepositoryError::Corruption(format!(
                "{} records for step '{step_id}' of run {run_id}",
                rows.len()
            ))),
        }
    }

    async fn complete_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let existing = sqlx::query("SELECT * FROM step_executions WHERE run_id = ? AND step_id = ?")
            .bind(step.run_id.to_string())
            .bind(&step.step_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .map(|row| decode_step(&row))
            .transpose()?;

        let result = step.result.as_ref().map(to_json).transpose()?;
        match existing {
            None => {
                insert_step(&mut tx, step).await?;
            }
            Some(existing) => match existing.status {
                StepStatus::Completed if existing.result == step.result => return Ok(()),
                StepStatus::Completed | StepStatus::Failed => {
                    return Err(RepositoryError::Conflict(format!(
                        "step '{}' is already {}",
                        step.step_id,
                        existing.status.as_str()
                    )));
                }
                StepStatus::Pending => {
                    sqlx::query(
                        r#"UPDATE step_executions
                           SET status = 'completed', result = ?,
                               attempt_count = MAX(attempt_count, ?),
                               next_retry_at = NULL, updated_at = ?
                           WHERE run_id = ? AND step_id = ?"#,
                    )
                    .bind(&result)
                    .bind(i64::from(step.attempt_count))
                    .bind(format_datetime(&step.updated_at))
                    .bind(step.run_id.to_string())
                    .bind(&step.step_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_err)?;
                }
            },
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn insert_pending_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        insert_step(&mut tx, step).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn record_step_failure(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let existing = sqlx::query("SELECT status FROM step_executions WHERE run_id = ? AND step_id = ?")
            .bind(step.run_id.to_string())
            .bind(&step.step_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;

        match existing {
            None => insert_step(&mut tx, step).await?,
            Some(row) => {
                let status: String = row.try_get("status").map_err(query_err)?;
                if status != StepStatus::Pending.as_str() {
                    return Err(RepositoryError::Conflict(format!(
                        "step '{}' is already {status}",
                        step.step_id
                    )));
                }
                sqlx::query(
                    r#"UPDATE step_executions
                       SET attempt_count = MAX(attempt_count, ?),
                           next_retry_at = ?, last_error = ?, updated_at = ?
                       WHERE run_id = ? AND step_id = ?"#,
                )
                .bind(i64::from(step.attempt_count))
                .bind(step.next_retry_at.as_ref().map(format_datetime))
                .bind(step.last_error.as_ref().map(to_json).transpose()?)
                .bind(format_datetime(&step.updated_at))
                .bind(step.run_id.to_string())
                .bind(&step.step_id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
            }
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn dead_letter_step(
        &self,
        step: &StepExecution,
        entry: &DeadLetterEntry,
        run_error: &RunError,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let run_id = step.run_id.to_string();

        let status: String = sqlx::query("SELECT status FROM runs WHERE run_id = ?")
            .bind(&run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?
            .try_get("status")
            .map_err(query_err)?;
        let status: RunStatus = status.parse().map_err(RepositoryError::Corruption)?;
        if status.is_terminal() && status != RunStatus::DeadLettered {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} is already {status}"
            )));
        }

        let existing = sqlx::query("SELECT status FROM step_executions WHERE run_id = ? AND step_id = ?")
            .bind(&run_id)
            .bind(&step.step_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;
        match existing {
            None => insert_step(&mut tx, step).await?,
            Some(row) => {
                let current: String = row.try_get("status").map_err(query_err)?;
                if current == StepStatus::Completed.as_str() {
                    return Err(RepositoryError::Conflict(format!(
                        "step '{}' is already completed",
                        step.step_id
                    )));
                }
                sqlx::query(
                    r#"UPDATE step_executions
                       SET status = 'failed', attempt_count = MAX(attempt_count, ?),
                           next_retry_at = NULL, last_error = ?, updated_at = ?
                       WHERE run_id = ? AND step_id = ?"#,
                )
                .bind(i64::from(step.attempt_count))
                .bind(step.last_error.as_ref().map(to_json).transpose()?)
                .bind(format_datetime(&step.updated_at))
                .bind(&run_id)
                .bind(&step.step_id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
            }
        }

        sqlx::query(
            r#"INSERT INTO dead_letters
               (run_id, step_id, workflow_id, payload, error, failure_count, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_id) DO NOTHING"#,
        )
        .bind(entry.run_id.to_string())
        .bind(&entry.step_id)
        .bind(&entry.workflow_id)
        .bind(to_json(&entry.payload)?)
        .bind(to_json(&entry.error)?)
        .bind(i64::from(entry.failure_count))
        .bind(format_datetime(&entry.created_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        sqlx::query(
            r#"UPDATE runs SET status = 'dead_lettered', error = ?, updated_at = ?
               WHERE run_id = ? AND status != 'dead_lettered'"#,
        )
        .bind(to_json(run_error)?)
        .bind(format_datetime(&step.updated_at))
        .bind(&run_id)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        run_id: Option<&Uuid>,
    ) -> Result<Vec<DeadLetterEntry>, RepositoryError> {
        let rows = match run_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM dead_letters WHERE run_id = ? ORDER BY created_at ASC",
                )
                .bind(id.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM dead_letters ORDER BY created_at ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DeadLetterRow::from_row(row).map_err(query_err)?;
            entries.push(r.into_entry()?);
        }
        Ok(entries)
    }

    async fn purge_dead_letters(&self, older_than: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE created_at < ?")
            .bind(format_datetime(&older_than))
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected())
    }
}

async fn insert_step(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    step: &StepExecution,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO step_executions
           (run_id, step_id, position, status, result, attempt_count,
            next_retry_at, last_error, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(step.run_id.to_string())
    .bind(&step.step_id)
    .bind(i64::from(step.position))
    .bind(step.status.as_str())
    .bind(step.result.as_ref().map(to_json).transpose()?)
    .bind(i64::from(step.attempt_count))
    .bind(step.next_retry_at.as_ref().map(format_datetime))
    .bind(step.last_error.as_ref().map(to_json).transpose()?)
    .bind(format_datetime(&step.created_at))
    .bind(format_datetime(&step.updated_at))
    .execute(&mut **tx)
    .await
    .map_err(|e| write_err(e, || format!("step '{}' already recorded", step.step_id)))?;
    Ok(())
}
