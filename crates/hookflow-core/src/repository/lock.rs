//! Per-run mutual exclusion port.
//!
//! A `RunLock` grants at most one holder per run id at a time. Holders are
//! identified by an opaque token so a release can never drop someone else's
//! lock. `LocalRunLock` covers a single process; the SQLite lease lock in
//! hookflow-infra covers every process sharing the database.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hookflow_types::error::RepositoryError;
use uuid::Uuid;

/// Repository trait for per-run locks.
pub trait RunLock: Send + Sync + 'static {
    /// Try once to take the lock for `run_id`. Returns `false` if it is held.
    fn try_acquire(
        &self,
        run_id: &Uuid,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Release the lock if `holder` still owns it.
    fn release(
        &self,
        run_id: &Uuid,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Release from a context that cannot await, such as `Drop`.
    ///
    /// The default spawns `release` on the current tokio runtime. Outside a
    /// runtime nothing happens and a lease-based lock waits for expiry.
    fn release_detached(self: Arc<Self>, run_id: Uuid, holder: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(run_id = %run_id, "No runtime to release run lock on");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = self.release(&run_id, &holder).await {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to release run lock");
            }
        });
    }
}

/// In-process run lock backed by a concurrent map.
#[derive(Debug, Default)]
pub struct LocalRunLock {
    holders: DashMap<Uuid, String>,
}

impl LocalRunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs currently locked.
    pub fn held(&self) -> usize {
        self.holders.len()
    }
}

impl RunLock for LocalRunLock {
    async fn try_acquire(&self, run_id: &Uuid, holder: &str) -> Result<bool, RepositoryError> {
        match self.holders.entry(*run_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(holder.to_string());
                Ok(true)
            }
        }
    }

    async fn release(&self, run_id: &Uuid, holder: &str) -> Result<(), RepositoryError> {
        self.holders.remove_if(run_id, |_, current| current == holder);
        Ok(())
    }

    fn release_detached(self: Arc<Self>, run_id: Uuid, holder: String) {
        self.holders.remove_if(&run_id, |_, current| *current == holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let lock = LocalRunLock::new();
        let run_id = Uuid::now_v7();

        assert!(lock.try_acquire(&run_id, "a").await.unwrap());
        assert!(!lock.try_acquire(&run_id, "b").await.unwrap());

        lock.release(&run_id, "a").await.unwrap();
        assert!(lock.try_acquire(&run_id, "b").await.unwrap());
    }

    #[tokio::test]
    async fn release_by_other_holder_is_ignored() {
        let lock = LocalRunLock::new();
        let run_id = Uuid::now_v7();

        assert!(lock.try_acquire(&run_id, "a").await.unwrap());
        lock.release(&run_id, "intruder").await.unwrap();
        assert_eq!(lock.held(), 1);
        assert!(!lock.try_acquire(&run_id, "b").await.unwrap());
    }

    #[tokio::test]
    async fn unrelated_runs_do_not_contend() {
        let lock = LocalRunLock::new();
        assert!(lock.try_acquire(&Uuid::now_v7(), "a").await.unwrap());
        assert!(lock.try_acquire(&Uuid::now_v7(), "a").await.unwrap());
        assert_eq!(lock.held(), 2);
    }

    #[test]
    fn detached_release_is_synchronous() {
        let lock = Arc::new(LocalRunLock::new());
        let run_id = Uuid::now_v7();
        lock.holders.insert(run_id, "a".to_string());

        Arc::clone(&lock).release_detached(run_id, "intruder".to_string());
        assert_eq!(lock.held(), 1);
        Arc::clone(&lock).release_detached(run_id, "a".to_string());
        assert_eq!(lock.held(), 0);
    }
}
