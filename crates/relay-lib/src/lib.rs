//! Cluster relay library
//!
//! This crate provides the core functionality for:
//! - Watching workflow pods, nodes, node usage and pod events
//! - Change deduplication with TTL trackers
//! - Reliable, acknowledged streaming to the relay backend
//! - Health checks, progress liveness and observability

pub mod envelope;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod progress;
pub mod proto;
pub mod quantity;
pub mod sync;
pub mod tracker;
pub mod usage;
pub mod watch;
pub mod watchers;

pub use error::{RelayError, RelayResult};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthReport, ReadinessReport,
};
pub use models::*;
pub use observability::{RelayMetrics, StructuredLogger};
pub use progress::ProgressSink;
