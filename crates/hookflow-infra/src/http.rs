//! reqwest-backed `OutboundClient` for `call` steps.
//!
//! Transport failures (connect, TLS, timeout, body read) map to
//! `OutboundError::Transport` and are retried as transient step failures.
//! Any HTTP status is returned to the workflow as a response.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use hookflow_core::workflow::outbound::{
    OutboundClient, OutboundError, OutboundRequest, OutboundResponse,
};

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ReqwestOutboundClient {
    client: reqwest::Client,
}

impl ReqwestOutboundClient {
    pub fn new() -> Result<Self, OutboundError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, OutboundError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hookflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OutboundError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn execute(&self, request: OutboundRequest) -> Result<OutboundResponse, OutboundError> {
        let method: reqwest::Method = request.method.parse().map_err(|_| {
            OutboundError::InvalidRequest(format!("invalid HTTP method: {}", request.method))
        })?;
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| OutboundError::InvalidRequest(format!("invalid URL '{}': {e}", request.url)))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            OutboundError::Transport(format!("request to '{}' failed: {e}", request.url))
        })?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| OutboundError::Transport(format!("failed to read response body: {e}")))?;

        tracing::info!(
            url = request.url.as_str(),
            status,
            body_len = text.len(),
            "Outbound call completed"
        );

        Ok(OutboundResponse {
            status,
            headers,
            body: parse_body(&text),
        })
    }
}

impl OutboundClient for ReqwestOutboundClient {
    fn send<'a>(
        &'a self,
        request: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OutboundResponse, OutboundError>> + Send + 'a>> {
        Box::pin(self.execute(request))
    }
}

/// JSON bodies are parsed; anything else is kept as a string. Empty is null.
fn parse_body(text: &str) -> serde_json::Value {
    if text.trim().is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}
