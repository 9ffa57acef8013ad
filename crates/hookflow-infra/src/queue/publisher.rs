//! `CallbackScheduler` over an HTTP publish endpoint (QStash-compatible).
//!
//! Each callback is one `POST {publish_url}/{callback_base_url}/{workflow_id}`
//! carrying the payload as JSON, a bearer token, a deduplication id (SHA-256
//! of the engine's dedup key) and, for delayed delivery, a not-before time in
//! unix seconds. The queue answers with the id of the queued message.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hookflow_core::workflow::scheduler::{CallbackScheduler, MessageId, SchedulerError};
use hookflow_types::callback::CallbackPayload;
use hookflow_types::config::QueueConfig;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::circuit::CircuitBreaker;

const DEDUP_HEADER: &str = "Upstash-Deduplication-Id";
const NOT_BEFORE_HEADER: &str = "Upstash-Not-Before";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("publish request failed: {0}")]
    Transport(String),

    #[error("queue returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid queue response: {0}")]
    InvalidResponse(String),
}

impl QueueError {
    /// Whether the failure says the queue itself is unhealthy.
    fn is_outage(&self) -> bool {
        match self {
            QueueError::Transport(_) => true,
            QueueError::Status { status, .. } => *status >= 500 || *status == 429,
            QueueError::Client(_) | QueueError::InvalidResponse(_) => false,
        }
    }
}

impl From<QueueError> for SchedulerError {
    fn from(err: QueueError) -> Self {
        if err.is_outage() {
            SchedulerError::Unavailable(err.to_string())
        } else {
            SchedulerError::Rejected(err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    #[serde(alias = "messageId")]
    message_id: String,
}

pub struct HttpQueuePublisher {
    client: reqwest::Client,
    config: QueueConfig,
    breaker: Option<CircuitBreaker>,
}

impl HttpQueuePublisher {
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("hookflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| QueueError::Client(e.to_string()))?;
        let breaker = CircuitBreaker::from_config("queue", &config.circuit_breaker);
        Ok(Self {
            client,
            config,
            breaker,
        })
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Publish endpoint for callbacks of `workflow_id`.
    pub fn publish_endpoint(&self, workflow_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.publish_url.trim_end_matches('/'),
            self.config.callback_base_url.trim_end_matches('/'),
            workflow_id
        )
    }

    async fn publish(
        &self,
        payload: &CallbackPayload,
        not_before: Option<DateTime<Utc>>,
        dedup_key: &str,
    ) -> Result<MessageId, QueueError> {
        let mut request = self
            .client
            .post(self.publish_endpoint(&payload.workflow_id))
            .bearer_auth(&self.config.token)
            .header(DEDUP_HEADER, deduplication_id(dedup_key))
            .json(payload);
        if let Some(at) = not_before {
            request = request.header(NOT_BEFORE_HEADER, at.timestamp().to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|e| QueueError::InvalidResponse(e.to_string()))?;
        Ok(parsed.message_id)
    }
}

impl CallbackScheduler for HttpQueuePublisher {
    async fn schedule_callback(
        &self,
        payload: &CallbackPayload,
        not_before: Option<DateTime<Utc>>,
        dedup_key: &str,
    ) -> Result<MessageId, SchedulerError> {
        if let Some(breaker) = &self.breaker {
            breaker
                .check()
                .map_err(|retry_in| SchedulerError::CircuitOpen { retry_in })?;
        }

        match self.publish(payload, not_before, dedup_key).await {
            Ok(message_id) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success();
                }
                tracing::debug!(
                    run_id = %payload.run_id,
                    message_id = %message_id,
                    "Callback published"
                );
                Ok(message_id)
            }
            Err(err) => {
                if let Some(breaker) = &self.breaker {
                    if err.is_outage() {
                        breaker.record_failure();
                    }
                }
                tracing::warn!(run_id = %payload.run_id, error = %err, "Callback publish failed");
                Err(err.into())
            }
        }
    }
}

/// Hex SHA-256 of the dedup key, safe for use as a header value.
pub fn deduplication_id(dedup_key: &str) -> String {
    let digest = Sha256::digest(dedup_key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookflow_types::config::CircuitBreakerConfig;
    use uuid::Uuid;

    fn config(publish_url: &str) -> QueueConfig {
        QueueConfig {
            publish_url: publish_url.to_string(),
            token: "secret".to_string(),
            callback_base_url: "https://app.example.com/hookflow/".to_string(),
            request_timeout_secs: 2,
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold: 2,
                recovery_timeout_secs: 60,
                half_open_successes: 1,
            },
        }
    }

    #[test]
    fn deduplication_id_is_stable_hex() {
        let a = deduplication_id("run-charge-1");
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, deduplication_id("run-charge-1"));
        assert_ne!(a, deduplication_id("run-charge-2"));
    }

    #[test]
    fn endpoint_appends_callback_url_and_workflow() {
        let publisher = HttpQueuePublisher::new(config("https://queue.example.com/v2/publish/")).unwrap();
        assert_eq!(
            publisher.publish_endpoint("order"),
            "https://queue.example.com/v2/publish/https://app.example.com/hookflow/order"
        );
    }

    #[test]
    fn status_errors_map_to_scheduler_errors() {
        let outage: SchedulerError = QueueError::Status {
            status: 503,
            body: String::new(),
        }
        .into();
        assert!(matches!(outage, SchedulerError::Unavailable(_)));

        let rejected: SchedulerError = QueueError::Status {
            status: 400,
            body: "bad".to_string(),
        }
        .into();
        assert!(matches!(rejected, SchedulerError::Rejected(_)));
    }

    #[tokio::test]
    async fn unreachable_queue_opens_the_circuit() {
        let publisher = HttpQueuePublisher::new(config("http://127.0.0.1:9/v2/publish")).unwrap();
        let payload = CallbackPayload::initial(Uuid::now_v7(), "order", serde_json::Value::Null);

        for _ in 0..2 {
            let err = publisher
                .schedule_callback(&payload, None, "k")
                .await
                .unwrap_err();
            assert!(matches!(err, SchedulerError::Unavailable(_)));
        }

        let err = publisher
            .schedule_callback(&payload, None, "k")
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::CircuitOpen { .. }));
    }
}
