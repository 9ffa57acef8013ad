//! Circuit breaker for the queue publisher.
//!
//! While the queue is down every publish would wait for a timeout. After
//! `failure_threshold` consecutive failures the circuit opens and publishes
//! fail immediately. Once `recovery_timeout` has passed, requests are let
//! through as probes; `half_open_successes` successful probes close the
//! circuit and any failed probe opens it again.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use hookflow_types::config::CircuitBreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward threshold.
    Closed { consecutive_failures: u32 },
    /// Requests are refused until `recovery_timeout` has elapsed.
    Open { opened_at: Instant },
    /// Probing: counts successful requests toward closing.
    HalfOpen { successes: u32 },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: Mutex<CircuitState>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_successes: u32,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            half_open_successes: half_open_successes.max(1),
        }
    }

    /// A breaker for `config`, or `None` when it is disabled.
    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Option<Self> {
        config.enabled.then(|| {
            Self::new(
                name,
                config.failure_threshold,
                Duration::from_secs(config.recovery_timeout_secs),
                config.half_open_successes,
            )
        })
    }

    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.transition(&mut state);
        state.clone()
    }

    /// `Ok` if a request may go through, else the time until the next probe.
    pub fn check(&self) -> Result<(), Duration> {
        let mut state = self.lock();
        self.transition(&mut state);
        match &*state {
            CircuitState::Open { opened_at } => {
                Err(self.recovery_timeout.saturating_sub(opened_at.elapsed()))
            }
            _ => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        match &*state {
            CircuitState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.half_open_successes {
                    tracing::info!(breaker = %self.name, "Circuit closed, queue recovered");
                    *state = CircuitState::Closed {
                        consecutive_failures: 0,
                    };
                } else {
                    *state = CircuitState::HalfOpen { successes };
                }
            }
            CircuitState::Closed { .. } => {
                *state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
            }
            // A request that started before the circuit opened.
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        match &*state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    tracing::warn!(breaker = %self.name, failures, "Circuit opened");
                    *state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                } else {
                    tracing::debug!(
                        breaker = %self.name,
                        failures,
                        threshold = self.failure_threshold,
                        "Queue failure recorded"
                    );
                    *state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            CircuitState::HalfOpen { .. } => {
                tracing::warn!(breaker = %self.name, "Probe failed, circuit reopened");
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Open -> HalfOpen once the recovery timeout has elapsed.
    fn transition(&self, state: &mut CircuitState) {
        if let CircuitState::Open { opened_at } = state {
            if opened_at.elapsed() >= self.recovery_timeout {
                tracing::info!(breaker = %self.name, "Circuit half-open, probing queue");
                *state = CircuitState::HalfOpen { successes: 0 };
            }
        }
    }
}
