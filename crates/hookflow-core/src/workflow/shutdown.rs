//! Graceful shutdown: stop taking callbacks, then wait for in-flight runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    token: CancellationToken,
    /// Invocation count per run id (duplicates of one run may overlap).
    runs: DashMap<Uuid, usize>,
    active: AtomicUsize,
    drained: Notify,
}

/// Tracks in-flight invocations. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    inner: Arc<Inner>,
}

/// Marks one invocation as in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
    run_id: Uuid,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invocation of `run_id`. Returns `None` once shutdown began.
    pub fn track(&self, run_id: Uuid) -> Option<InFlightGuard> {
        // Count first so a concurrent drain cannot miss this invocation.
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        *self.inner.runs.entry(run_id).or_insert(0) += 1;
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            run_id,
        };
        if self.inner.token.is_cancelled() {
            return None;
        }
        Some(guard)
    }

    pub fn begin_shutdown(&self) {
        if !self.inner.token.is_cancelled() {
            tracing::info!(
                in_flight = self.in_flight(),
                "Shutdown requested, rejecting new callbacks"
            );
        }
        self.inner.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once shutdown has begun.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Run ids with an invocation in flight.
    pub fn in_flight_runs(&self) -> Vec<Uuid> {
        self.inner.runs.iter().map(|e| *e.key()).collect()
    }

    /// Wait until no invocation is in flight. Returns `false` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(
                    in_flight = self.in_flight(),
                    runs = ?self.in_flight_runs(),
                    "Shutdown drain timed out"
                );
                return false;
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .runs
            .remove_if_mut(&self.run_id, |_, count| {
                *count -= 1;
                *count == 0
            });
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_and_releases_invocations() {
        let manager = ShutdownManager::new();
        let run_id = Uuid::now_v7();

        let first = manager.track(run_id).unwrap();
        let second = manager.track(run_id).unwrap();
        assert_eq!(manager.in_flight(), 2);
        assert_eq!(manager.in_flight_runs(), vec![run_id]);

        drop(first);
        assert_eq!(manager.in_flight_runs(), vec![run_id]);
        drop(second);
        assert_eq!(manager.in_flight(), 0);
        assert!(manager.in_flight_runs().is_empty());
    }

    #[tokio::test]
    async fn rejects_after_shutdown_begins() {
        let manager = ShutdownManager::new();
        manager.begin_shutdown();
        assert!(manager.is_shutting_down());
        assert!(manager.track(Uuid::now_v7()).is_none());
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_work() {
        let manager = ShutdownManager::new();
        let guard = manager.track(Uuid::now_v7()).unwrap();
        manager.begin_shutdown();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        assert!(manager.wait_for_drain(Duration::from_secs(2)).await);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out() {
        let manager = ShutdownManager::new();
        let _guard = manager.track(Uuid::now_v7()).unwrap();
        manager.begin_shutdown();
        assert!(!manager.wait_for_drain(Duration::from_millis(20)).await);
    }
}
