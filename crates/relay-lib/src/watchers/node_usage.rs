//! Per-node pod resource usage watcher
//!
//! Pod changes update the [`NodeUsageAggregator`] immediately; reports are
//! debounced and sent once per dirty node on every flush tick.

use super::{default_accelerators, finish, parse_quantity, skip_malformed, DomainWatcher, RebuildReason};
use crate::error::{RelayError, RelayResult};
use crate::models::{PodContribution, PodKey, ResourceTuple};
use crate::observability::{RelayMetrics, StructuredLogger};
use crate::proto::Payload;
use crate::sync::Outbox;
use crate::usage::NodeUsageAggregator;
use crate::watch::{ClusterWatch, Selector, WatchEvent};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WATCHER: &str = "node-usage";

#[derive(Debug, Clone)]
pub struct UsageWatcherConfig {
    /// Namespaces whose pods are excluded from the non-managed subtotal
    pub managed_namespaces: Vec<String>,
    /// Count pending pods that already have a node
    pub include_pending: bool,
    pub accelerator_resources: Vec<String>,
    /// Debounce window between usage reports
    pub flush_interval: Duration,
}

impl Default for UsageWatcherConfig {
    fn default() -> Self {
        Self {
            managed_namespaces: Vec::new(),
            include_pending: false,
            accelerator_resources: default_accelerators(),
            flush_interval: Duration::from_secs(10),
        }
    }
}

impl UsageWatcherConfig {
    pub fn selector(&self) -> Selector {
        if self.include_pending {
            Selector::all().fields("spec.nodeName!=,status.phase!=Succeeded,status.phase!=Failed")
        } else {
            Selector::all().fields("status.phase=Running")
        }
    }
}

/// Whether a pod no longer holds resources on its node
///
/// Terminal phase, a deletion marker, all containers terminated, or a phase
/// outside the counted set all count as removal.
pub fn is_removed(pod: &Pod, include_pending: bool) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    let Some(status) = pod.status.as_ref() else {
        return true;
    };
    let counted = match status.phase.as_deref() {
        Some("Running") => true,
        Some("Pending") => include_pending,
        _ => false,
    };
    if !counted {
        return true;
    }

    let containers = status.container_statuses.as_deref().unwrap_or_default();
    !containers.is_empty()
        && containers.iter().all(|c| {
            c.state
                .as_ref()
                .map_or(false, |s| s.terminated.is_some())
        })
}

fn requests_of(container: &Container) -> Option<&BTreeMap<String, Quantity>> {
    container.resources.as_ref()?.requests.as_ref()
}

fn tuple_from(
    name: &str,
    requests: Option<&BTreeMap<String, Quantity>>,
    accelerators: &[String],
) -> RelayResult<ResourceTuple> {
    let mut tuple = ResourceTuple::default();
    let Some(requests) = requests else {
        return Ok(tuple);
    };
    for (resource, quantity) in requests {
        match resource.as_str() {
            "cpu" => tuple.cpu_millis += parse_quantity("pod", name, resource, quantity)?.millis_ceil(),
            "memory" => tuple.memory_kib += parse_quantity("pod", name, resource, quantity)?.kib_ceil(),
            "ephemeral-storage" => {
                tuple.storage_kib += parse_quantity("pod", name, resource, quantity)?.kib_ceil()
            }
            other if accelerators.iter().any(|a| a == other) => {
                tuple.accelerators += parse_quantity("pod", name, resource, quantity)?.whole_ceil()
            }
            _ => {}
        }
    }
    Ok(tuple)
}

/// Resources a pod holds on its node, or `None` if it holds none
///
/// Per resource: the larger of the summed app container requests and the
/// largest init container request, plus declared pod overhead.
pub fn pod_contribution(pod: &Pod, config: &UsageWatcherConfig) -> RelayResult<Option<PodContribution>> {
    if is_removed(pod, config.include_pending) {
        return Ok(None);
    }
    let name = pod.name_any();
    let spec = pod
        .spec
        .as_ref()
        .ok_or_else(|| RelayError::malformed("pod", &name, "pod has no spec"))?;
    let Some(node_name) = spec.node_name.clone().filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if spec.containers.is_empty() {
        return Err(RelayError::malformed("pod", &name, "pod has no containers"));
    }

    let accelerators = &config.accelerator_resources;
    let mut app = ResourceTuple::default();
    for container in &spec.containers {
        app.add(&tuple_from(&name, requests_of(container), accelerators)?);
    }
    let mut effective = app;
    for container in spec.init_containers.iter().flatten() {
        effective = effective.max(&tuple_from(&name, requests_of(container), accelerators)?);
    }
    effective.add(&tuple_from(&name, spec.overhead.as_ref(), accelerators)?);

    Ok(Some(PodContribution {
        node_name,
        namespace: pod.namespace().unwrap_or_default(),
        resources: effective,
    }))
}

fn pod_key(pod: &Pod) -> PodKey {
    PodKey::new(pod.namespace().unwrap_or_default(), pod.name_any())
}

pub struct NodeUsageWatcher {
    cluster: Arc<dyn ClusterWatch>,
    config: UsageWatcherConfig,
    aggregator: NodeUsageAggregator,
    metrics: RelayMetrics,
    logger: StructuredLogger,
}

impl NodeUsageWatcher {
    pub fn new(cluster: Arc<dyn ClusterWatch>, config: UsageWatcherConfig, agent_id: &str) -> Self {
        Self {
            cluster,
            aggregator: NodeUsageAggregator::new(config.managed_namespaces.iter().cloned()),
            config,
            metrics: RelayMetrics::new(),
            logger: StructuredLogger::new(agent_id, WATCHER),
        }
    }

    pub fn aggregator(&self) -> &NodeUsageAggregator {
        &self.aggregator
    }

    fn on_apply(&self, pod: &Pod) {
        let key = pod_key(pod);
        match pod_contribution(pod, &self.config) {
            Ok(Some(contribution)) => {
                if !self.aggregator.add_pod(key, contribution) {
                    self.metrics.inc_suppressed(WATCHER);
                }
            }
            Ok(None) => {
                if self.aggregator.delete_pod(&key) {
                    debug!(pod = %key, "Pod released its resources");
                }
            }
            Err(e) => skip_malformed(&self.metrics, WATCHER, &e),
        }
    }

    fn on_delete(&self, pod: &Pod) {
        self.aggregator.delete_pod(&pod_key(pod));
    }

    fn rebuild(&self, pods: Vec<Pod>, reason: RebuildReason) {
        let mut contributions = Vec::with_capacity(pods.len());
        for pod in &pods {
            match pod_contribution(pod, &self.config) {
                Ok(Some(contribution)) => contributions.push((pod_key(pod), contribution)),
                Ok(None) => {}
                Err(e) => skip_malformed(&self.metrics, WATCHER, &e),
            }
        }
        self.aggregator.rebuild(contributions);
        self.metrics.inc_rebuild(WATCHER, reason.as_str());
        self.logger.log_rebuild(reason.as_str(), pods.len());
    }

    /// Send one usage report per dirty node
    async fn flush(&self, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let dirty = self.aggregator.take_dirty();
        for (i, node) in dirty.iter().enumerate() {
            let usage = self.aggregator.get_node_usage(node);
            if let Err(e) = outbox
                .send(Payload::NodeUsage(usage.to_proto()), cancel)
                .await
            {
                // Unsent nodes are reported on the next flush
                for node in &dirty[i..] {
                    self.aggregator.mark_dirty(node);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn watch(&self, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let mut sub = self.cluster.pods(&self.config.selector());
        let initial = sub.wait_for_cache_sync("pod", cancel).await?;
        self.rebuild(initial, RebuildReason::InitialSync);

        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                event = sub.next_event(cancel) => event,
                _ = ticker.tick() => {
                    self.flush(outbox, cancel).await?;
                    continue;
                }
            };
            let Some(event) = event else {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                return Err(RelayError::WatchClosed("pod watch"));
            };

            match event {
                WatchEvent::Applied(pod) => self.on_apply(&pod),
                WatchEvent::Deleted(pod) => self.on_delete(&pod),
                WatchEvent::Resynced(pods) => self.rebuild(pods, RebuildReason::Resync),
                WatchEvent::Gap(reason) => {
                    warn!(watcher = WATCHER, reason = %reason, "Watch gap, rebuilding from cache");
                    self.rebuild(sub.snapshot(), RebuildReason::Gap);
                }
            }
        }
    }
}

#[async_trait]
impl DomainWatcher for NodeUsageWatcher {
    fn name(&self) -> &'static str {
        WATCHER
    }

    async fn run(&self, outbox: Outbox, cancel: CancellationToken) -> RelayResult<()> {
        finish(self.watch(&outbox, &cancel).await)
    }
}
