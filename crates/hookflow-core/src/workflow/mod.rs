//! Durable step execution.
//!
//! A workflow is an ordinary async function that is re-invoked from its first
//! line on every queue callback. The `ReplayExecutor` hands it a
//! `WorkflowContext` whose step primitives consult the run's step ledger:
//! completed steps return their recorded result, and the first unresolved step
//! executes, persists its outcome and suspends the invocation. The `Engine`
//! wraps one invocation with the per-run lock and schedules the next callback.

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod guard;
pub mod ledger;
pub mod outbound;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
