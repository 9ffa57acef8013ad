//! Durable step execution engine and repository trait definitions for Hookflow.
//!
//! This crate defines the "ports" (repository traits, scheduler and outbound
//! HTTP traits) that the infrastructure layer implements, plus the replay
//! executor that drives workflow functions against the step ledger. It depends
//! only on `hookflow-types` -- never on `hookflow-infra` or any database/IO crate.

pub mod clock;
pub mod repository;
pub mod workflow;
