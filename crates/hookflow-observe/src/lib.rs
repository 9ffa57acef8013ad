//! Observability setup for Hookflow binaries.

pub mod tracing_setup;
