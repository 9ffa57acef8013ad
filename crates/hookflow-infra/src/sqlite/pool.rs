//! SQLite connections for the run store and lease lock.
//!
//! Runs, steps, leases and dead letters all live in one WAL-mode database.
//! Ledger writes are serialized through a single writer connection so a
//! `complete_step` never interleaves with another invocation's write; replay
//! reads go through a separate read-only pool.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

const READER_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only pool used for ledger replay and listings.
    pub reader: SqlitePool,
    /// Single connection for every run state transition.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if missing) the database at `database_url` and apply
    /// pending migrations before the reader pool connects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url = %database_url, "Database pool ready");
        Ok(Self { reader, writer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(dir: &tempfile::TempDir) -> DatabasePool {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("runs.db").display());
        DatabasePool::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn migrations_create_run_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir).await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(names, vec!["dead_letters", "run_locks", "runs", "step_executions"]);
    }

    #[tokio::test]
    async fn writer_uses_wal_with_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir).await;

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let (fk,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn reader_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir).await;

        let result = sqlx::query("DELETE FROM runs").execute(&pool.reader).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reopening_keeps_applied_migrations() {
        let dir = tempfile::tempdir().unwrap();
        drop(open(&dir).await);
        let pool = open(&dir).await;

        let (applied,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        assert!(applied >= 1);
    }
}
