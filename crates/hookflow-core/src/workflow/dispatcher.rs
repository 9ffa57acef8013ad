//! Engine: the entry point for queue callbacks.
//!
//! One `handle_callback` call is one invocation of a run:
//!
//! 1. Reject if shutting down or the workflow is not registered.
//! 2. Take the run lock. A contended lock is a no-op (`Dispatch::InProgress`).
//! 3. Execute the workflow against the durable store, or against a
//!    `MemoryStore` seeded from the payload when persistence is disabled.
//! 4. On suspension, publish the next callback with its not-before time.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use hookflow_types::callback::CallbackPayload;
use hookflow_types::config::{EngineConfig, PersistenceMode};
use hookflow_types::error::{ConfigError, RepositoryError};
use hookflow_types::run::{Run, RunError};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::repository::lock::RunLock;
use crate::repository::memory::MemoryStore;
use crate::repository::store::WorkflowStore;

use super::error::EngineError;
use super::executor::{Outcome, ReplayExecutor, Suspension};
use super::guard::{ConcurrencyGuard, LockOutcome};
use super::ledger::StepLedger;
use super::outbound::OutboundClient;
use super::registry::{Workflow, WorkflowRegistry};
use super::retry::RetryPolicy;
use super::scheduler::{CallbackScheduler, MessageId, dedup_key};
use super::shutdown::ShutdownManager;

/// Step id used in the dedup key of a run's first callback.
const TRIGGER_STEP: &str = "trigger";
/// Step id used in the dedup key of a republished callback.
const RESUME_STEP: &str = "resume";

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Where run state lives. Must agree with `EngineConfig::persistence`.
pub enum Persistence<S> {
    Durable(Arc<S>),
    /// Per-invocation memory seeded from the payload.
    Disabled,
}

impl<S> Persistence<S> {
    fn mode(&self) -> PersistenceMode {
        match self {
            Persistence::Durable(_) => PersistenceMode::Durable,
            Persistence::Disabled => PersistenceMode::Disabled,
        }
    }
}

fn mode_name(mode: PersistenceMode) -> &'static str {
    match mode {
        PersistenceMode::Durable => "durable",
        PersistenceMode::Disabled => "disabled",
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// What the engine did with one callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Dispatch {
    Completed {
        result: Value,
    },
    /// The run continues in a later callback.
    Suspended {
        step_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        not_before: Option<DateTime<Utc>>,
        /// `None` when publishing the next callback failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    Failed {
        error: RunError,
        dead_lettered: bool,
    },
    /// Another invocation of the run holds the lock. Nothing was done.
    InProgress,
    Rejected {
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<S, L, Q> {
    config: Arc<EngineConfig>,
    persistence: Persistence<S>,
    registry: Arc<WorkflowRegistry>,
    guard: ConcurrencyGuard<L>,
    scheduler: Arc<Q>,
    outbound: Arc<dyn OutboundClient>,
    executor: ReplayExecutor,
    shutdown: ShutdownManager,
    clock: Arc<dyn Clock>,
}

impl<S, L, Q> Engine<S, L, Q>
where
    S: WorkflowStore,
    L: RunLock,
    Q: CallbackScheduler,
{
    /// Build an engine. Validates `config` and checks that `persistence`
    /// matches the configured mode.
    pub fn new(
        config: EngineConfig,
        persistence: Persistence<S>,
        registry: WorkflowRegistry,
        lock: Arc<L>,
        scheduler: Arc<Q>,
        outbound: Arc<dyn OutboundClient>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if persistence.mode() != config.persistence {
            return Err(ConfigError::PersistenceMismatch {
                configured: mode_name(config.persistence),
                supplied: mode_name(persistence.mode()),
            }
            .into());
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let executor = ReplayExecutor::new(
            RetryPolicy::from_config(&config.retry),
            Arc::clone(&outbound),
            Arc::clone(&clock),
            config.execution_timeout(),
        );
        let guard = ConcurrencyGuard::new(lock, config.lock.clone());

        tracing::info!(
            persistence = mode_name(config.persistence),
            workflows = registry.len(),
            max_attempts = config.retry.max_attempts,
            "Engine initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            persistence,
            registry: Arc::new(registry),
            guard,
            scheduler,
            outbound,
            executor,
            shutdown: ShutdownManager::new(),
            clock,
        })
    }

    /// Replace the wall clock, e.g. with a `ManualClock` in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.executor = ReplayExecutor::new(
            self.executor.policy().clone(),
            Arc::clone(&self.outbound),
            Arc::clone(&clock),
            self.config.execution_timeout(),
        );
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// The durable store, if persistence is enabled.
    pub fn store(&self) -> Option<&Arc<S>> {
        match &self.persistence {
            Persistence::Durable(store) => Some(store),
            Persistence::Disabled => None,
        }
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.shutdown
    }

    /// Handle one queue callback.
    ///
    /// Errors are reserved for persistence failures and violations of the
    /// workflow contract. Contention and rejection are ordinary dispatches.
    pub async fn handle_callback(&self, payload: CallbackPayload) -> Result<Dispatch, EngineError> {
        let run_id = payload.run_id;

        let Some(_in_flight) = self.shutdown.track(run_id) else {
            tracing::info!(run_id = %run_id, "Callback rejected during shutdown");
            return Ok(Dispatch::Rejected {
                reason: "engine is shutting down".to_string(),
            });
        };

        let Some(workflow) = self.registry.get(&payload.workflow_id) else {
            tracing::warn!(
                run_id = %run_id,
                workflow = %payload.workflow_id,
                "Callback for unknown workflow"
            );
            return Ok(Dispatch::Rejected {
                reason: format!("unknown workflow '{}'", payload.workflow_id),
            });
        };

        let outcome = self
            .guard
            .with_run_lock(run_id, self.invoke(&payload, workflow.as_ref()))
            .await?;

        match outcome {
            LockOutcome::Acquired(dispatch) => dispatch,
            LockOutcome::Contended => {
                tracing::info!(run_id = %run_id, "Run already in progress, skipping callback");
                Ok(Dispatch::InProgress)
            }
        }
    }

    async fn invoke(
        &self,
        payload: &CallbackPayload,
        workflow: &dyn Workflow,
    ) -> Result<Dispatch, EngineError> {
        match &self.persistence {
            Persistence::Durable(store) => self.invoke_with(store.as_ref(), payload, workflow).await,
            Persistence::Disabled => {
                let store = MemoryStore::seeded(payload, self.clock.now())?;
                let dispatch = self.invoke_with(&store, payload, workflow).await?;
                if let Dispatch::Failed {
                    dead_lettered: true,
                    error,
                } = &dispatch
                {
                    tracing::warn!(
                        run_id = %payload.run_id,
                        step_id = ?error.step_id,
                        "Persistence disabled, dead letter is not retained"
                    );
                }
                Ok(dispatch)
            }
        }
    }

    async fn invoke_with<T: WorkflowStore>(
        &self,
        store: &T,
        payload: &CallbackPayload,
        workflow: &dyn Workflow,
    ) -> Result<Dispatch, EngineError> {
        let run_id = payload.run_id;
        let outcome = self
            .executor
            .execute(store, run_id, workflow, payload.input.clone())
            .await?;

        match outcome {
            Outcome::Completed(result) => Ok(Dispatch::Completed { result }),
            Outcome::Failed(error) => Ok(Dispatch::Failed {
                dead_lettered: error.step_id.is_some(),
                error,
            }),
            Outcome::Suspended(suspension) => {
                let message_id = self
                    .schedule_next(store, run_id, workflow.name(), &suspension)
                    .await?;
                Ok(Dispatch::Suspended {
                    step_id: suspension.step_id,
                    not_before: suspension.hint.not_before(),
                    message_id,
                })
            }
        }
    }

    /// Publish the callback that continues a suspended run.
    ///
    /// Publishing failures are logged, not retried; the run resumes when the
    /// queue redelivers the current callback.
    async fn schedule_next<T: WorkflowStore>(
        &self,
        store: &T,
        run_id: Uuid,
        workflow_id: &str,
        suspension: &Suspension,
    ) -> Result<Option<MessageId>, EngineError> {
        let run = store.get_run(&run_id).await?;
        let input = run.map(|r| r.input).unwrap_or(Value::Null);
        let ledger = StepLedger::from_records(store.list_steps(&run_id).await?)?;
        let next = ledger.next_payload(run_id, workflow_id, input);
        let key = dedup_key(&run_id, &suspension.step_id, suspension.attempt);
        let not_before = suspension.hint.not_before();

        match self
            .scheduler
            .schedule_callback(&next, not_before, &key)
            .await
        {
            Ok(message_id) => {
                tracing::debug!(
                    run_id = %run_id,
                    step_id = %suspension.step_id,
                    attempt = suspension.attempt,
                    not_before = ?not_before,
                    message_id = %message_id,
                    "Scheduled next callback"
                );
                Ok(Some(message_id))
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %run_id,
                    step_id = %suspension.step_id,
                    dedup_key = %key,
                    error = %e,
                    "Failed to schedule next callback"
                );
                Ok(None)
            }
        }
    }

    /// Start a new run of `workflow_id` and publish its first callback.
    pub async fn trigger(&self, workflow_id: &str, input: Value) -> Result<Uuid, EngineError> {
        if self.registry.get(workflow_id).is_none() {
            return Err(EngineError::UnknownWorkflow(workflow_id.to_string()));
        }

        let run_id = Uuid::now_v7();
        if let Persistence::Durable(store) = &self.persistence {
            let run = Run::new(run_id, workflow_id, input.clone(), self.clock.now());
            store.create_run_if_absent(&run).await?;
        }

        let payload = CallbackPayload::initial(run_id, workflow_id, input);
        let key = dedup_key(&run_id, TRIGGER_STEP, 0);
        let message_id = self.scheduler.schedule_callback(&payload, None, &key).await?;

        tracing::info!(
            run_id = %run_id,
            workflow = %workflow_id,
            message_id = %message_id,
            "Run triggered"
        );
        Ok(run_id)
    }

    /// Republish the next callback of an unfinished run whose callback was
    /// lost, e.g. after a scheduling failure or a crashed process.
    ///
    /// Returns `None` for a finished run. Requires durable persistence.
    pub async fn resume(&self, run_id: Uuid) -> Result<Option<MessageId>, EngineError> {
        let Persistence::Durable(store) = &self.persistence else {
            return Err(EngineError::Contract(
                "resuming a run requires durable persistence".to_string(),
            ));
        };
        let run = store
            .get_run(&run_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if run.status.is_terminal() {
            return Ok(None);
        }

        let ledger = StepLedger::from_records(store.list_steps(&run_id).await?)?;
        let not_before = ledger.pending_step().and_then(|p| p.not_before);
        let key = dedup_key(&run_id, RESUME_STEP, ledger.len() as u32);
        let payload = ledger.next_payload(run_id, &run.workflow_id, run.input);
        let message_id = self
            .scheduler
            .schedule_callback(&payload, not_before, &key)
            .await?;

        tracing::info!(
            run_id = %run_id,
            workflow = %run.workflow_id,
            status = %run.status,
            message_id = %message_id,
            "Run resumed"
        );
        Ok(Some(message_id))
    }

    /// Delete dead letters older than the configured retention.
    ///
    /// Returns 0 when no retention is configured or persistence is disabled.
    pub async fn purge_dead_letters(&self) -> Result<u64, EngineError> {
        let (Some(days), Persistence::Durable(store)) =
            (self.config.dead_letter.retention_days, &self.persistence)
        else {
            return Ok(0);
        };

        let cutoff = self.clock.now() - TimeDelta::days(i64::from(days));
        let removed = store.purge_dead_letters(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, retention_days = days, "Purged dead letters");
        }
        Ok(removed)
    }

    /// Stop accepting callbacks and wait for in-flight invocations.
    ///
    /// Returns `false` if the drain timed out.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.begin_shutdown();
        self.shutdown
            .wait_for_drain(self.config.shutdown_timeout())
            .await
    }
}
