//! Outbound HTTP port used by the `call` step primitive.
//!
//! The trait is object-safe (boxed futures) so the context can hold an
//! `Arc<dyn OutboundClient>` without becoming generic. The reqwest adapter
//! lives in hookflow-infra.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::error::StepError;

/// An HTTP request issued by a `call` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body, sent with `Content-Type: application/json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// The recorded response of a `call` step.
///
/// Non-2xx statuses are returned as responses, not failures: the workflow
/// decides what a 4xx or 5xx means for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, or the raw text as a JSON string.
    pub body: serde_json::Value,
}

impl OutboundResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboundError {
    /// Connection, DNS, TLS or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request could not be built (bad method or URL).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<OutboundError> for StepError {
    fn from(err: OutboundError) -> Self {
        match err {
            OutboundError::Transport(m) => StepError::Transient(m),
            OutboundError::InvalidRequest(m) => StepError::Permanent(m),
        }
    }
}

/// Performs outbound HTTP requests for `call` steps.
pub trait OutboundClient: Send + Sync {
    fn send<'a>(
        &'a self,
        request: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OutboundResponse, OutboundError>> + Send + 'a>>;
}
