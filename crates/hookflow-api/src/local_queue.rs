//! In-process delay queue for running workflows from the command line.
//!
//! Published callbacks go into an unbounded channel. The receiving side
//! waits until each callback's not-before time and hands it to the engine.
//! Repeated dedup keys are dropped, like a hosted queue would.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use hookflow_core::workflow::scheduler::{CallbackScheduler, MessageId, SchedulerError};
use hookflow_types::callback::CallbackPayload;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    pub payload: CallbackPayload,
    pub not_before: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Wait until the delivery is due.
    pub async fn wait_until_due(&self) {
        if let Some(at) = self.not_before {
            let wait = (at - Utc::now()).to_std().unwrap_or_default();
            if !wait.is_zero() {
                tracing::debug!(
                    run_id = %self.payload.run_id,
                    wait_ms = wait.as_millis() as u64,
                    "Holding callback until due"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

pub struct LocalQueue {
    sender: mpsc::UnboundedSender<Delivery>,
    seen: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl LocalQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            sender,
            seen: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        };
        (queue, receiver)
    }
}

impl CallbackScheduler for LocalQueue {
    async fn schedule_callback(
        &self,
        payload: &CallbackPayload,
        not_before: Option<DateTime<Utc>>,
        dedup_key: &str,
    ) -> Result<MessageId, SchedulerError> {
        let first = self
            .seen
            .lock()
            .map_err(|_| SchedulerError::Unavailable("dedup set poisoned".to_string()))?
            .insert(dedup_key.to_string());
        let message_id = format!("local-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        if !first {
            tracing::debug!(dedup_key, "Duplicate callback dropped");
            return Ok(message_id);
        }

        self.sender
            .send(Delivery {
                message_id: message_id.clone(),
                payload: payload.clone(),
                not_before,
            })
            .map_err(|_| SchedulerError::Unavailable("local queue closed".to_string()))?;
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use uuid::Uuid;

    #[tokio::test]
    async fn duplicate_keys_are_delivered_once() {
        let (queue, mut receiver) = LocalQueue::new();
        let payload = CallbackPayload::initial(Uuid::now_v7(), "order", serde_json::Value::Null);

        queue.schedule_callback(&payload, None, "k-1").await.unwrap();
        queue.schedule_callback(&payload, None, "k-1").await.unwrap();
        queue.schedule_callback(&payload, None, "k-2").await.unwrap();

        assert_eq!(receiver.recv().await.unwrap().message_id, "local-1");
        assert_eq!(receiver.recv().await.unwrap().message_id, "local-3");
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_receiver_is_unavailable() {
        let (queue, receiver) = LocalQueue::new();
        drop(receiver);
        let payload = CallbackPayload::initial(Uuid::now_v7(), "order", serde_json::Value::Null);
        let err = queue.schedule_callback(&payload, None, "k").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn past_not_before_does_not_wait() {
        let delivery = Delivery {
            message_id: "m".to_string(),
            payload: CallbackPayload::initial(Uuid::now_v7(), "order", serde_json::Value::Null),
            not_before: Some(Utc::now() - TimeDelta::seconds(5)),
        };
        tokio::time::timeout(std::time::Duration::from_millis(100), delivery.wait_until_due())
            .await
            .unwrap();
    }
}
