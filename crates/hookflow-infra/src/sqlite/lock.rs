//! Lease-based run lock shared by every process using the database.
//!
//! A lease row per run id holds the owner token and an expiry in unix
//! milliseconds. Acquisition is one upsert that only overwrites an expired
//! lease, so the single-writer connection makes it a compare-and-set. A holder
//! that dies without releasing blocks the run until its lease expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use hookflow_core::clock::{Clock, SystemClock};
use hookflow_core::repository::lock::RunLock;
use hookflow_types::error::RepositoryError;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunLock`.
pub struct SqliteRunLock {
    pool: DatabasePool,
    lease_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteRunLock {
    pub fn new(pool: DatabasePool, lease_ttl: Duration) -> Self {
        Self {
            pool,
            lease_ttl,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn ttl_millis(&self) -> i64 {
        TimeDelta::from_std(self.lease_ttl)
            .map(|d| d.num_milliseconds())
            .unwrap_or(i64::MAX)
    }
}

impl RunLock for SqliteRunLock {
    async fn try_acquire(&self, run_id: &Uuid, holder: &str) -> Result<bool, RepositoryError> {
        let now = self.now_millis();
        let expires_at = now.saturating_add(self.ttl_millis());

        let result = sqlx::query(
            r#"INSERT INTO run_locks (run_id, holder, expires_at) VALUES (?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 holder = excluded.holder,
                 expires_at = excluded.expires_at
               WHERE run_locks.expires_at <= ?"#,
        )
        .bind(run_id.to_string())
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let acquired = result.rows_affected() > 0;
        if acquired {
            tracing::trace!(run_id = %run_id, holder, "Run lease acquired");
        }
        Ok(acquired)
    }

    async fn release(&self, run_id: &Uuid, holder: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM run_locks WHERE run_id = ? AND holder = ?")
            .bind(run_id.to_string())
            .bind(holder)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hookflow_core::clock::ManualClock;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = DatabasePool::new(&url).await.unwrap();
        std::mem::forget(dir);
        pool
    }

    fn lock_with_clock(pool: DatabasePool) -> (SqliteRunLock, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        ));
        let lock = SqliteRunLock::new(pool, Duration::from_secs(300))
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
        (lock, clock)
    }

    #[tokio::test]
    async fn test_lease_excludes_second_holder() {
        let (lock, _clock) = lock_with_clock(test_pool().await);
        let run_id = Uuid::now_v7();

        assert!(lock.try_acquire(&run_id, "a").await.unwrap());
        assert!(!lock.try_acquire(&run_id, "b").await.unwrap());
        assert!(!lock.try_acquire(&run_id, "a").await.unwrap());

        lock.release(&run_id, "a").await.unwrap();
        assert!(lock.try_acquire(&run_id, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_other_holder_is_ignored() {
        let (lock, _clock) = lock_with_clock(test_pool().await);
        let run_id = Uuid::now_v7();

        assert!(lock.try_acquire(&run_id, "a").await.unwrap());
        lock.release(&run_id, "b").await.unwrap();
        assert!(!lock.try_acquire(&run_id, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let (lock, clock) = lock_with_clock(test_pool().await);
        let run_id = Uuid::now_v7();

        assert!(lock.try_acquire(&run_id, "crashed").await.unwrap());
        clock.advance(TimeDelta::seconds(299));
        assert!(!lock.try_acquire(&run_id, "b").await.unwrap());
        clock.advance(TimeDelta::seconds(1));
        assert!(lock.try_acquire(&run_id, "b").await.unwrap());

        // The stale holder can no longer release the new lease.
        lock.release(&run_id, "crashed").await.unwrap();
        assert!(!lock.try_acquire(&run_id, "c").await.unwrap());
    }

    #[tokio::test]
    async fn test_locks_are_per_run() {
        let (lock, _clock) = lock_with_clock(test_pool().await);
        assert!(lock.try_acquire(&Uuid::now_v7(), "a").await.unwrap());
        assert!(lock.try_acquire(&Uuid::now_v7(), "a").await.unwrap());
    }
}
