//! SQLite storage layer.
//!
//! Store and lock implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod lock;
pub mod pool;
pub mod store;
