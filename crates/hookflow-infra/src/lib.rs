//! Infrastructure layer for Hookflow.
//!
//! Contains implementations of the ports defined in `hookflow-core`: SQLite
//! storage for runs, the step ledger, dead letters and run leases; a reqwest
//! client for `call` steps; an HTTP queue publisher guarded by a circuit
//! breaker; and the TOML configuration loader.

pub mod config;
pub mod http;
pub mod queue;
pub mod sqlite;
