//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (hookflow-infra) implements. The core crate never depends on any
//! specific storage technology. `MemoryStore` and `LocalRunLock` are the
//! in-process implementations used by the disabled-persistence mode and tests.

pub mod lock;
pub mod memory;
pub mod store;
