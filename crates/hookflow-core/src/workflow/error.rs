//! Error and control-flow types for workflow execution.

use std::time::Duration;

use hookflow_types::error::{ConfigError, RepositoryError};
use hookflow_types::run::RunError;

use super::scheduler::SchedulerError;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Failure of a step action, as reported by workflow code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Eligible for retry with backoff.
    #[error("transient step failure: {0}")]
    Transient(String),

    /// Never retried; the step is dead-lettered immediately.
    #[error("permanent step failure: {0}")]
    Permanent(String),
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        StepError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StepError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::Transient(m) | StepError::Permanent(m) => m,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Fatal errors for one invocation. Anything here propagates to the caller,
/// whose queue redelivers the callback later.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store unavailable or corrupt.
    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    /// The workflow requested steps in a different order than recorded.
    #[error("determinism violation: {0}")]
    DeterminismViolation(String),

    /// Misuse of the step primitives by workflow code.
    #[error("workflow contract violation: {0}")]
    Contract(String),

    #[error("unknown workflow: '{0}'")]
    UnknownWorkflow(String),

    #[error("run belongs to workflow '{stored}', callback names '{requested}'")]
    WorkflowMismatch { stored: String, requested: String },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The invocation timed out outside of any step action.
    #[error("workflow invocation exceeded {0:?}")]
    ExecutionTimeout(Duration),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("failed to schedule callback: {0}")]
    Schedule(#[from] SchedulerError),
}

// ---------------------------------------------------------------------------
// Interrupt
// ---------------------------------------------------------------------------

/// Early exit from a workflow function.
///
/// Step primitives return `Err(Interrupt::Suspend)` once the invocation has
/// made its one unit of progress; workflow code forwards it with `?`.
#[derive(Debug)]
pub enum Interrupt {
    /// Not an error: stop here and continue in a later invocation.
    Suspend,
    /// Fail the whole run without retry.
    Failed(RunError),
    /// Unrecoverable condition for this invocation.
    Abort(EngineError),
}

impl Interrupt {
    /// Fail the run from workflow code.
    pub fn fail(message: impl Into<String>) -> Self {
        Interrupt::Failed(RunError::workflow(message))
    }
}

impl From<EngineError> for Interrupt {
    fn from(err: EngineError) -> Self {
        Interrupt::Abort(err)
    }
}

/// Return type of step primitives and workflow functions.
pub type StepResult<T> = Result<T, Interrupt>;
