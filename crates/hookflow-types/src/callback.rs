//! Inbound callback payload exchanged with the external queue.
//!
//! Every invocation of a run arrives as one `CallbackPayload`. The
//! `completed_steps` list is advisory: with durable persistence the step
//! ledger is the source of truth and the list is only echoed back to the
//! queue. With persistence disabled it is the only memory the run has.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A step result carried in the payload, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step_id: String,
    pub result: serde_json::Value,
}

/// The unresolved step the previous invocation suspended on.
///
/// Lets the ephemeral mode keep counting attempts and honour wake times
/// without a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingStep {
    pub step_id: String,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

/// Body of a queue callback for one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub run_id: Uuid,
    pub workflow_id: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub completed_steps: Vec<CompletedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_step: Option<PendingStep>,
}

/// Why an inbound payload was refused before reaching the engine.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl CallbackPayload {
    /// Payload for the first invocation of a freshly triggered run.
    pub fn initial(run_id: Uuid, workflow_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            input,
            completed_steps: Vec::new(),
            pending_step: None,
        }
    }

    /// Parse a raw request body, enforcing the configured size limit.
    pub fn from_slice(body: &[u8], max_bytes: usize) -> Result<Self, PayloadError> {
        if body.len() > max_bytes {
            return Err(PayloadError::TooLarge {
                size: body.len(),
                limit: max_bytes,
            });
        }

        let payload: CallbackPayload =
            serde_json::from_slice(body).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;

        if payload.run_id.is_nil() {
            return Err(PayloadError::MissingField("run_id"));
        }
        if payload.workflow_id.trim().is_empty() {
            return Err(PayloadError::MissingField("workflow_id"));
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_payload() {
        let run_id = Uuid::now_v7();
        let body = json!({"run_id": run_id, "workflow_id": "order"}).to_string();
        let payload = CallbackPayload::from_slice(body.as_bytes(), 1024).unwrap();
        assert_eq!(payload.run_id, run_id);
        assert!(payload.completed_steps.is_empty());
        assert!(payload.input.is_null());
        assert!(payload.pending_step.is_none());
    }

    #[test]
    fn preserves_completed_step_order() {
        let body = json!({
            "run_id": Uuid::now_v7(),
            "workflow_id": "order",
            "input": {"order_id": "12345"},
            "completed_steps": [
                {"step_id": "validate", "result": true},
                {"step_id": "sleep", "result": null}
            ]
        })
        .to_string();
        let payload = CallbackPayload::from_slice(body.as_bytes(), 4096).unwrap();
        let ids: Vec<&str> = payload.completed_steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["validate", "sleep"]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let body = vec![b' '; 32];
        let err = CallbackPayload::from_slice(&body, 16).unwrap_err();
        assert!(matches!(err, PayloadError::TooLarge { size: 32, limit: 16 }));
    }

    #[test]
    fn rejects_invalid_json_and_missing_fields() {
        let err = CallbackPayload::from_slice(b"{not json", 1024).unwrap_err();
        assert!(matches!(err, PayloadError::InvalidJson(_)));

        let body = json!({"run_id": Uuid::nil(), "workflow_id": "order"}).to_string();
        let err = CallbackPayload::from_slice(body.as_bytes(), 1024).unwrap_err();
        assert!(matches!(err, PayloadError::MissingField("run_id")));

        let body = json!({"run_id": Uuid::now_v7(), "workflow_id": "  "}).to_string();
        let err = CallbackPayload::from_slice(body.as_bytes(), 1024).unwrap_err();
        assert!(matches!(err, PayloadError::MissingField("workflow_id")));
    }
}
