//! Shared domain types for Hookflow.
//!
//! Runs, step executions, dead-letter entries, the inbound callback payload,
//! engine configuration and the error enums shared by every layer.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod callback;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod run;
pub mod step;
