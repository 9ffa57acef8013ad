//! HTTP queue adapter: publishes run callbacks for later delivery.

pub mod circuit;
pub mod publisher;
