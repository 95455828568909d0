//! Node resource-state watcher
//!
//! Reports a [`NodeSnapshot`] whenever a node changes (or its TTL window
//! elapses), a tombstone when it is deleted, and after every rebuild one
//! inventory of all known hostnames so the peer can drop nodes it missed.

use super::{default_accelerators, finish, parse_quantity, skip_malformed, DomainWatcher, RebuildReason};
use crate::error::{RelayError, RelayResult};
use crate::models::{NodeSnapshot, NodeTaint};
use crate::observability::{RelayMetrics, StructuredLogger};
use crate::proto::{NodeInventory, Payload};
use crate::sync::Outbox;
use crate::tracker::{NodeStateTracker, TrackerConfig};
use crate::watch::{ClusterWatch, Selector, WatchEvent};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WATCHER: &str = "node";

/// A node condition that must hold for the node to count as available
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionRule {
    pub condition_type: String,
    pub status: String,
}

impl ConditionRule {
    pub fn new(condition_type: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            condition_type: condition_type.into(),
            status: status.into(),
        }
    }
}

/// Conditions required for availability; `Ready=True` by default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityRules {
    pub required: Vec<ConditionRule>,
}

impl Default for AvailabilityRules {
    fn default() -> Self {
        Self {
            required: vec![ConditionRule::new("Ready", "True")],
        }
    }
}

impl AvailabilityRules {
    /// Whether every rule is met and the node is not cordoned
    pub fn is_available(&self, node: &Node) -> bool {
        let cordoned = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if cordoned {
            return false;
        }

        let conditions = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default();
        self.required.iter().all(|rule| {
            conditions
                .iter()
                .any(|c| c.type_ == rule.condition_type && c.status == rule.status)
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeWatcherConfig {
    pub label_selector: Option<String>,
    pub availability: AvailabilityRules,
    /// Extended resources reported as accelerator counts
    pub accelerator_resources: Vec<String>,
    /// How often all nodes are re-derived from the cache
    pub resync_interval: Duration,
    pub tracker: TrackerConfig,
}

impl Default for NodeWatcherConfig {
    fn default() -> Self {
        Self {
            label_selector: None,
            availability: AvailabilityRules::default(),
            accelerator_resources: default_accelerators(),
            resync_interval: Duration::from_secs(300),
            tracker: TrackerConfig::default(),
        }
    }
}

impl NodeWatcherConfig {
    pub fn selector(&self) -> Selector {
        match &self.label_selector {
            Some(labels) => Selector::all().labels(labels.clone()),
            None => Selector::all(),
        }
    }
}

/// Build the reportable snapshot of a node
///
/// cpu is normalised to millicores, memory and ephemeral storage to KiB
/// (rounded up), configured accelerators to whole counts. Other
/// allocatable resources are not reported.
pub fn build_snapshot(node: &Node, config: &NodeWatcherConfig) -> RelayResult<NodeSnapshot> {
    let hostname = node.name_any();
    if hostname.is_empty() {
        return Err(RelayError::malformed("node", "<unnamed>", "node has no name"));
    }
    let status = node.status.as_ref();

    let mut conditions: Vec<String> = status
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .filter(|c| c.status == "True")
        .map(|c| c.type_.clone())
        .collect();
    conditions.sort();
    conditions.dedup();

    let mut allocatable = BTreeMap::new();
    if let Some(resources) = status.and_then(|s| s.allocatable.as_ref()) {
        for (name, quantity) in resources {
            let value = match name.as_str() {
                "cpu" => parse_quantity("node", &hostname, name, quantity)?.millis_ceil(),
                "memory" | "ephemeral-storage" => {
                    parse_quantity("node", &hostname, name, quantity)?.kib_ceil()
                }
                other if config.accelerator_resources.iter().any(|a| a == other) => {
                    parse_quantity("node", &hostname, name, quantity)?.whole_ceil()
                }
                _ => continue,
            };
            allocatable.insert(name.clone(), value);
        }
    }

    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .into_iter()
        .flatten()
        .map(|t| NodeTaint {
            key: t.key.clone(),
            value: t.value.clone().unwrap_or_default(),
            effect: t.effect.clone(),
            time_added: t.time_added.as_ref().map(|time| time.0),
        })
        .collect();

    Ok(NodeSnapshot {
        available: config.availability.is_available(node),
        hostname,
        conditions,
        allocatable,
        labels: node.labels().clone(),
        taints,
        deleted: false,
    })
}

pub struct NodeWatcher {
    cluster: Arc<dyn ClusterWatch>,
    config: NodeWatcherConfig,
    tracker: NodeStateTracker,
    metrics: RelayMetrics,
    logger: StructuredLogger,
}

impl NodeWatcher {
    pub fn new(cluster: Arc<dyn ClusterWatch>, config: NodeWatcherConfig, agent_id: &str) -> Self {
        Self {
            cluster,
            tracker: NodeStateTracker::new(&config.tracker),
            config,
            metrics: RelayMetrics::new(),
            logger: StructuredLogger::new(agent_id, WATCHER),
        }
    }

    pub fn tracker(&self) -> &NodeStateTracker {
        &self.tracker
    }

    async fn on_apply(&self, node: &Node, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let snapshot = match build_snapshot(node, &self.config) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                skip_malformed(&self.metrics, WATCHER, &e);
                return Ok(());
            }
        };

        if !self.tracker.should_report(&snapshot) {
            self.metrics.inc_suppressed(WATCHER);
            return Ok(());
        }

        debug!(node = %snapshot.hostname, available = snapshot.available, "Reporting node state");
        let hostname = snapshot.hostname.clone();
        if let Err(e) = outbox
            .send(Payload::NodeResources(snapshot.to_proto()), cancel)
            .await
        {
            self.tracker.remove(&hostname);
            return Err(e);
        }
        Ok(())
    }

    async fn send_tombstone(&self, hostname: &str, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        debug!(node = %hostname, "Reporting node deletion");
        let tombstone = NodeSnapshot::tombstone(hostname);
        outbox
            .send(Payload::NodeResources(tombstone.to_proto()), cancel)
            .await
    }

    async fn on_delete(&self, node: &Node, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let hostname = node.name_any();
        // Forgotten only once queued, so a rebuild still sees the node as gone
        self.send_tombstone(&hostname, outbox, cancel).await?;
        self.tracker.remove(&hostname);
        Ok(())
    }

    /// Re-derive every node from `nodes`, report nodes that disappeared,
    /// then send the inventory
    async fn rebuild(
        &self,
        nodes: Vec<Node>,
        reason: RebuildReason,
        outbox: &Outbox,
        cancel: &CancellationToken,
    ) -> RelayResult<()> {
        let live: HashSet<String> = nodes.iter().map(|n| n.name_any()).collect();

        for hostname in self.tracker.departed(&live) {
            self.send_tombstone(&hostname, outbox, cancel).await?;
            self.tracker.remove(&hostname);
        }
        for node in &nodes {
            self.on_apply(node, outbox, cancel).await?;
        }

        let mut hostnames: Vec<String> = live.into_iter().collect();
        hostnames.sort();
        outbox
            .send(Payload::NodeInventory(NodeInventory { hostnames }), cancel)
            .await?;

        self.metrics.inc_rebuild(WATCHER, reason.as_str());
        self.logger.log_rebuild(reason.as_str(), nodes.len());
        Ok(())
    }

    async fn watch(&self, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let mut sub = self.cluster.nodes(&self.config.selector());
        let initial = sub.wait_for_cache_sync("node", cancel).await?;
        self.rebuild(initial, RebuildReason::InitialSync, outbox, cancel)
            .await?;

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The initial rebuild stands in for the first tick
        resync.tick().await;

        loop {
            let event = tokio::select! {
                event = sub.next_event(cancel) => event,
                _ = resync.tick() => {
                    self.rebuild(sub.snapshot(), RebuildReason::Periodic, outbox, cancel)
                        .await?;
                    continue;
                }
            };
            let Some(event) = event else {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                return Err(RelayError::WatchClosed("node watch"));
            };

            match event {
                WatchEvent::Applied(node) => self.on_apply(&node, outbox, cancel).await?,
                WatchEvent::Deleted(node) => self.on_delete(&node, outbox, cancel).await?,
                WatchEvent::Resynced(nodes) => {
                    self.rebuild(nodes, RebuildReason::Resync, outbox, cancel)
                        .await?
                }
                WatchEvent::Gap(reason) => {
                    warn!(watcher = WATCHER, reason = %reason, "Watch gap, rebuilding from cache");
                    self.rebuild(sub.snapshot(), RebuildReason::Gap, outbox, cancel)
                        .await?
                }
            }
        }
    }
}

#[async_trait]
impl DomainWatcher for NodeWatcher {
    fn name(&self) -> &'static str {
        WATCHER
    }

    async fn run(&self, outbox: Outbox, cancel: CancellationToken) -> RelayResult<()> {
        finish(self.watch(&outbox, &cancel).await)
    }
}
