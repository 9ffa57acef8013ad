//! Engine configuration types.
//!
//! `EngineConfig` is the single immutable configuration for an engine
//! instance. It is loaded from `hookflow.toml`, every field has a default,
//! and `validate()` is called exactly once when the engine is constructed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Whether run state survives across invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Runs, step ledger and dead letters live in the configured store.
    #[default]
    Durable,
    /// Best-effort in-memory state scoped to one invocation, seeded from the
    /// callback payload. For tests and ephemeral use.
    Disabled,
}

/// What to do when another invocation holds the run lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAcquisition {
    #[default]
    FailFast,
    /// Poll until `wait_timeout_ms` elapses.
    Wait,
}

/// Top-level configuration for an engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub persistence: PersistenceMode,

    /// SQLite URL. `None` falls back to the data directory default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub lock: LockConfig,

    /// Upper bound on one invocation of a workflow function. 0 disables.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// Inbound callback bodies above this size are rejected.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// How long a graceful shutdown waits for in-flight runs.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Outbound queue publisher. Absent when callbacks are scheduled in-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueConfig>,
}

/// Time reserved inside a lease for the store reads and writes around the
/// workflow body.
pub const LEASE_IO_MARGIN_SECS: u64 = 10;

fn default_execution_timeout_secs() -> u64 {
    30
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceMode::default(),
            database_url: None,
            retry: RetryConfig::default(),
            lock: LockConfig::default(),
            execution_timeout_secs: default_execution_timeout_secs(),
            max_payload_bytes: default_max_payload_bytes(),
            dead_letter: DeadLetterConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            queue: None,
        }
    }
}

impl EngineConfig {
    /// Check every cross-field constraint. Called once at engine construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.lock.validate()?;

        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_payload_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.dead_letter.retention_days == Some(0) {
            return Err(ConfigError::Invalid {
                field: "dead_letter.retention_days",
                reason: "must be at least 1 day when set".to_string(),
            });
        }
        if let Some(queue) = &self.queue {
            queue.validate()?;
        }
        if self.persistence == PersistenceMode::Durable {
            self.validate_lease_covers_invocation()?;
        }
        Ok(())
    }

    /// A durable invocation must finish inside its run lock lease, which is
    /// taken once and never renewed.
    fn validate_lease_covers_invocation(&self) -> Result<(), ConfigError> {
        if self.execution_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "execution_timeout_secs",
                reason: "must be greater than zero when persistence = \"durable\"".to_string(),
            });
        }
        let needed = self.execution_timeout_secs.saturating_add(LEASE_IO_MARGIN_SECS);
        if needed >= self.lock.lease_ttl_secs {
            return Err(ConfigError::Invalid {
                field: "execution_timeout_secs",
                reason: format!(
                    "plus {LEASE_IO_MARGIN_SECS}s of store I/O must stay below \
                     lock.lease_ttl_secs ({})",
                    self.lock.lease_ttl_secs
                ),
            });
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        (self.execution_timeout_secs > 0).then(|| Duration::from_secs(self.execution_timeout_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Step retry limits and exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per step, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.base_delay_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.base_delay_secs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.max_delay_secs < self.base_delay_secs {
            return Err(ConfigError::Invalid {
                field: "retry.max_delay_secs",
                reason: format!(
                    "{} is below base_delay_secs ({})",
                    self.max_delay_secs, self.base_delay_secs
                ),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub acquisition: LockAcquisition,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// A lease older than this is considered abandoned by a crashed holder.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

fn default_wait_timeout_ms() -> u64 {
    2_000
}

fn default_lease_ttl_secs() -> u64 {
    300
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquisition: LockAcquisition::default(),
            wait_timeout_ms: default_wait_timeout_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl LockConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "lock.lease_ttl_secs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.acquisition == LockAcquisition::Wait && self.wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "lock.wait_timeout_ms",
                reason: "must be greater than zero when acquisition = \"wait\"".to_string(),
            });
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Entries older than this are removed by the retention purge.
    /// `None` keeps entries until removed by hand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

// ---------------------------------------------------------------------------
// Queue publisher
// ---------------------------------------------------------------------------

/// HTTP queue used to schedule the next callback of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Publish endpoint, e.g. `https://qstash.upstash.io/v2/publish`.
    pub publish_url: String,
    /// Bearer token for the publish endpoint.
    pub token: String,
    /// Base URL the queue delivers callbacks to. The workflow id is appended.
    pub callback_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl QueueConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("queue.publish_url", &self.publish_url),
            ("queue.callback_base_url", &self.callback_base_url),
        ] {
            if !(value.starts_with("http://") || value.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("'{value}' is not an http(s) URL"),
                });
            }
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::Missing("queue.token"));
        }
        Ok(())
    }
}

/// Fail-fast protection for the queue publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before probing.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Successful probes needed to close the circuit again.
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

fn default_half_open_successes() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_successes: default_half_open_successes(),
        }
    }
}
