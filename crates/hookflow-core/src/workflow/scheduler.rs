//! Callback scheduler port.
//!
//! The engine never sleeps or retries on its own. After every suspension it
//! publishes the next callback through a `CallbackScheduler` with an optional
//! not-before time, and the queue delivers it (at least once) later.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hookflow_types::callback::CallbackPayload;
use uuid::Uuid;

/// Opaque identifier the queue assigns to a published callback.
pub type MessageId = String;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue rejected callback: {0}")]
    Rejected(String),

    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
}

/// Publishes run callbacks to an external queue.
pub trait CallbackScheduler: Send + Sync {
    /// Publish `payload` for delivery no earlier than `not_before`.
    ///
    /// Implementations should pass `dedup_key` to the queue so retried
    /// publishes of the same transition are delivered once.
    fn schedule_callback(
        &self,
        payload: &CallbackPayload,
        not_before: Option<DateTime<Utc>>,
        dedup_key: &str,
    ) -> impl std::future::Future<Output = Result<MessageId, SchedulerError>> + Send;
}

/// Deduplication key for the callback that follows `attempt` of `step_id`.
pub fn dedup_key(run_id: &Uuid, step_id: &str, attempt: u32) -> String {
    format!("{run_id}-{step_id}-{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_distinguishes_attempts() {
        let run_id = Uuid::now_v7();
        let first = dedup_key(&run_id, "charge", 1);
        let second = dedup_key(&run_id, "charge", 2);
        assert_ne!(first, second);
        assert_eq!(first, format!("{run_id}-charge-1"));
    }
}
