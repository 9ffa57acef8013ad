//! Concurrency guard: at most one invocation per run at a time.
//!
//! Duplicate callbacks from an at-least-once queue race for the same run. The
//! loser does not wait for the winner's result or retry; it reports
//! `LockOutcome::Contended` and the dispatcher turns that into a no-op.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use hookflow_types::config::{LockAcquisition, LockConfig};
use hookflow_types::error::RepositoryError;
use tokio::time::Instant;
use uuid::Uuid;

use crate::repository::lock::RunLock;

/// Interval between acquisition attempts in `wait` mode.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Result of running a body under the run lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Acquired(T),
    /// Another invocation holds the lock. The body was not run.
    Contended,
}

pub struct ConcurrencyGuard<L> {
    lock: Arc<L>,
    config: LockConfig,
}

impl<L: RunLock> ConcurrencyGuard<L> {
    pub fn new(lock: Arc<L>, config: LockConfig) -> Self {
        Self { lock, config }
    }

    /// Run `body` while holding the lock for `run_id`.
    ///
    /// The lock is released after the body returns or panics, and also when
    /// the caller drops the returned future mid-body.
    pub async fn with_run_lock<T, F>(
        &self,
        run_id: Uuid,
        body: F,
    ) -> Result<LockOutcome<T>, RepositoryError>
    where
        F: Future<Output = T>,
    {
        let holder = Uuid::now_v7().to_string();
        if !self.acquire(&run_id, &holder).await? {
            tracing::debug!(run_id = %run_id, "Run lock contended");
            return Ok(LockOutcome::Contended);
        }
        let held = HeldLock {
            lock: Arc::clone(&self.lock),
            run_id,
            holder: Some(holder),
        };

        let result = AssertUnwindSafe(body).catch_unwind().await;
        held.release().await;

        match result {
            Ok(value) => Ok(LockOutcome::Acquired(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn acquire(&self, run_id: &Uuid, holder: &str) -> Result<bool, RepositoryError> {
        if self.lock.try_acquire(run_id, holder).await? {
            return Ok(true);
        }
        if self.config.acquisition == LockAcquisition::FailFast {
            return Ok(false);
        }

        let deadline = Instant::now() + self.config.wait_timeout();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
            if self.lock.try_acquire(run_id, holder).await? {
                return Ok(true);
            }
        }
    }
}

/// A taken run lock. Dropping it without `release` hands the release to
/// `RunLock::release_detached`.
struct HeldLock<L: RunLock> {
    lock: Arc<L>,
    run_id: Uuid,
    holder: Option<String>,
}

impl<L: RunLock> HeldLock<L> {
    async fn release(mut self) {
        if let Some(holder) = self.holder.as_deref() {
            if let Err(e) = self.lock.release(&self.run_id, holder).await {
                tracing::warn!(run_id = %self.run_id, error = %e, "Failed to release run lock");
            }
        }
        self.holder = None;
    }
}

impl<L: RunLock> Drop for HeldLock<L> {
    fn drop(&mut self) {
        if let Some(holder) = self.holder.take() {
            tracing::debug!(run_id = %self.run_id, "Run lock released after cancellation");
            Arc::clone(&self.lock).release_detached(self.run_id, holder);
        }
    }
}
