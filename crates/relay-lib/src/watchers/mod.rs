//! Domain watchers
//!
//! Each watcher subscribes to cluster objects, turns changes into envelope
//! payloads, and pushes them onto its bounded send queue. Tracked state is
//! rebuilt from the watch cache on every resync and after every watch gap.
//!
//! - [`WorkflowWatcher`]: workflow task pod status
//! - [`NodeWatcher`]: node resource state and node inventory
//! - [`NodeUsageWatcher`]: per-node resource requests, debounced
//! - [`EventWatcher`]: pod events, deduplicated

mod event;
mod node;
mod node_usage;
mod workflow;


pub use event::{to_pod_event, EventWatcher, EventWatcherConfig};
pub use node::{build_snapshot, AvailabilityRules, ConditionRule, NodeWatcher, NodeWatcherConfig};
pub use node_usage::{is_removed, pod_contribution, NodeUsageWatcher, UsageWatcherConfig};
pub use workflow::{derive_pod_status, WorkflowWatcher, WorkflowWatcherConfig, DELETED_BEFORE_COMPLETION};

use crate::error::{RelayError, RelayResult};
use crate::observability::RelayMetrics;
use crate::quantity::{self, ParsedQuantity};
use crate::sync::Outbox;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Accelerator resource names counted by default
pub const DEFAULT_ACCELERATOR_RESOURCES: &[&str] = &["nvidia.com/gpu", "amd.com/gpu"];

pub(crate) fn default_accelerators() -> Vec<String> {
    DEFAULT_ACCELERATOR_RESOURCES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// A watcher run by a streaming session
#[async_trait]
pub trait DomainWatcher: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Watch and enqueue until `cancel` fires
    ///
    /// Returns `Ok` when cancelled; an error ends the session.
    async fn run(&self, outbox: Outbox, cancel: CancellationToken) -> RelayResult<()>;
}

/// Why tracked state is being rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    InitialSync,
    Resync,
    Gap,
    Periodic,
}

impl RebuildReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildReason::InitialSync => "initial_sync",
            RebuildReason::Resync => "resync",
            RebuildReason::Gap => "gap",
            RebuildReason::Periodic => "periodic",
        }
    }
}

/// Treat cancellation as a clean exit
pub(crate) fn finish(result: RelayResult<()>) -> RelayResult<()> {
    match result {
        Err(RelayError::Cancelled) => Ok(()),
        other => other,
    }
}

/// Log and count an object that could not be converted
pub(crate) fn skip_malformed(metrics: &RelayMetrics, watcher: &'static str, error: &RelayError) {
    metrics.inc_malformed(watcher);
    warn!(watcher, error = %error, "Skipping malformed object");
}

pub(crate) fn parse_quantity(
    kind: &'static str,
    name: &str,
    resource: &str,
    value: &Quantity,
) -> RelayResult<ParsedQuantity> {
    quantity::parse(&value.0)
        .map_err(|e| RelayError::malformed(kind, name, format!("{}: {}", resource, e)))
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_finish_maps_cancellation_to_ok() {
        assert!(finish(Err(RelayError::Cancelled)).is_ok());
        assert!(finish(Err(RelayError::WatchClosed("pod watch"))).is_err());
    }

    #[test]
    fn test_parse_quantity_reports_resource() {
        let err = parse_quantity("node", "n1", "cpu", &Quantity("lots".into())).unwrap_err();
        assert!(err.is_local());
        assert!(err.to_string().contains("cpu"));
    }
}
