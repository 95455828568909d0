//! Workflow task pod status watcher

use super::{finish, skip_malformed, DomainWatcher, RebuildReason};
use crate::error::{RelayError, RelayResult};
use crate::models::PodStatusRecord;
use crate::observability::{RelayMetrics, StructuredLogger};
use crate::proto::{Payload, PodStatusUpdate, TaskStatus};
use crate::sync::Outbox;
use crate::tracker::{PodStatusTracker, TaskKey, TrackerConfig};
use crate::watch::{ClusterWatch, Selector, WatchEvent};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, ContainerStatus, Pod, PodStatus};
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WATCHER: &str = "workflow";

/// Message reported for a task pod that vanished before finishing
pub const DELETED_BEFORE_COMPLETION: &str = "pod deleted before completion";

#[derive(Debug, Clone)]
pub struct WorkflowWatcherConfig {
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,
    pub workflow_label: String,
    pub task_label: String,
    pub retry_label: String,
    pub tracker: TrackerConfig,
}

impl Default for WorkflowWatcherConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workflow_label: "relay.dev/workflow-id".to_string(),
            task_label: "relay.dev/task-id".to_string(),
            retry_label: "relay.dev/retry-id".to_string(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl WorkflowWatcherConfig {
    /// Only pods carrying both ownership labels
    pub fn selector(&self) -> Selector {
        let mut selector =
            Selector::all().labels(format!("{},{}", self.workflow_label, self.task_label));
        if let Some(ns) = &self.namespace {
            selector = selector.namespace(ns.clone());
        }
        selector
    }

    /// Composite key from the pod's labels; the retry id defaults to "0"
    pub fn task_key(&self, pod: &Pod) -> RelayResult<TaskKey> {
        let labels = pod.labels();
        let label = |name: &str| labels.get(name).filter(|v| !v.is_empty()).cloned();

        let workflow_id = label(&self.workflow_label).ok_or_else(|| {
            RelayError::malformed("pod", pod.name_any(), "missing workflow id label")
        })?;
        let task_id = label(&self.task_label).ok_or_else(|| {
            RelayError::malformed("pod", pod.name_any(), "missing task id label")
        })?;
        let retry_id = label(&self.retry_label).unwrap_or_else(|| "0".to_string());
        Ok(TaskKey::new(workflow_id, task_id, retry_id))
    }
}

fn terminated(status: &ContainerStatus) -> Option<&ContainerStateTerminated> {
    status.state.as_ref()?.terminated.as_ref()
}

fn join_reason(reason: Option<&str>, message: Option<&str>) -> String {
    match (reason.filter(|r| !r.is_empty()), message.filter(|m| !m.is_empty())) {
        (Some(r), Some(m)) => format!("{}: {}", r, m),
        (Some(r), None) => r.to_string(),
        (None, Some(m)) => m.to_string(),
        (None, None) => String::new(),
    }
}

/// Why a pending pod is waiting: a container waiting reason first, then an
/// unsatisfied scheduling condition
fn pending_message(status: &PodStatus) -> String {
    let waiting = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .filter_map(|c| c.state.as_ref()?.waiting.as_ref())
        .find(|w| w.reason.is_some());
    if let Some(w) = waiting {
        return join_reason(w.reason.as_deref(), w.message.as_deref());
    }

    status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == "PodScheduled" && c.status == "False")
        .map(|c| join_reason(c.reason.as_deref(), c.message.as_deref()))
        .unwrap_or_default()
}

/// First failing container, init containers first
fn first_failure(status: &PodStatus) -> Option<&ContainerStateTerminated> {
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .filter_map(terminated)
        .find(|t| t.exit_code != 0)
}

fn failure_record(t: &ContainerStateTerminated) -> PodStatusRecord {
    PodStatusRecord::new(
        TaskStatus::Failed,
        t.exit_code,
        join_reason(t.reason.as_deref(), t.message.as_deref()),
    )
}

/// Derive the reportable status of a task pod
///
/// `Ok(None)` means the pod has no reportable status (unknown phase).
pub fn derive_pod_status(pod: &Pod) -> RelayResult<Option<PodStatusRecord>> {
    let Some(status) = pod.status.as_ref() else {
        return Ok(None);
    };
    let containers = status.container_statuses.as_deref().unwrap_or_default();

    let record = match status.phase.as_deref() {
        Some("Pending") => PodStatusRecord::new(TaskStatus::Pending, 0, pending_message(status)),
        Some("Running") => {
            // The phase lags behind containers that have already exited
            if !containers.is_empty() && containers.iter().all(|c| terminated(c).is_some()) {
                match first_failure(status) {
                    Some(t) => failure_record(t),
                    None => PodStatusRecord::new(TaskStatus::Succeeded, 0, ""),
                }
            } else {
                PodStatusRecord::new(TaskStatus::Running, 0, "")
            }
        }
        Some("Succeeded") => {
            if containers.is_empty() {
                return Err(RelayError::malformed(
                    "pod",
                    pod.name_any(),
                    "succeeded without container statuses",
                ));
            }
            PodStatusRecord::new(TaskStatus::Succeeded, 0, "")
        }
        Some("Failed") => {
            if let Some(reason) = status.reason.as_deref().filter(|r| !r.is_empty()) {
                // Pod-level failure such as eviction; no container exit code applies
                PodStatusRecord::new(
                    TaskStatus::Failed,
                    -1,
                    join_reason(Some(reason), status.message.as_deref()),
                )
            } else if let Some(t) = first_failure(status) {
                failure_record(t)
            } else if containers.is_empty() {
                return Err(RelayError::malformed(
                    "pod",
                    pod.name_any(),
                    "failed without reason or container statuses",
                ));
            } else {
                PodStatusRecord::new(TaskStatus::Failed, -1, "pod failed")
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(record))
}

pub struct WorkflowWatcher {
    cluster: Arc<dyn ClusterWatch>,
    config: WorkflowWatcherConfig,
    tracker: PodStatusTracker,
    metrics: RelayMetrics,
    logger: StructuredLogger,
}

impl WorkflowWatcher {
    pub fn new(cluster: Arc<dyn ClusterWatch>, config: WorkflowWatcherConfig, agent_id: &str) -> Self {
        Self {
            cluster,
            tracker: PodStatusTracker::new(&config.tracker),
            config,
            metrics: RelayMetrics::new(),
            logger: StructuredLogger::new(agent_id, WATCHER),
        }
    }

    pub fn tracker(&self) -> &PodStatusTracker {
        &self.tracker
    }

    fn update(&self, pod: &Pod, key: &TaskKey, record: &PodStatusRecord) -> PodStatusUpdate {
        PodStatusUpdate {
            workflow_id: key.workflow_id.clone(),
            task_id: key.task_id.clone(),
            retry_id: key.retry_id.clone(),
            namespace: pod.namespace().unwrap_or_default(),
            pod_name: pod.name_any(),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            status: record.status as i32,
            exit_code: record.exit_code,
            message: record.message.clone(),
        }
    }

    async fn on_apply(&self, pod: &Pod, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let key = match self.config.task_key(pod) {
            Ok(key) => key,
            Err(e) => {
                skip_malformed(&self.metrics, WATCHER, &e);
                return Ok(());
            }
        };
        let record = match derive_pod_status(pod) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(e) => {
                skip_malformed(&self.metrics, WATCHER, &e);
                return Ok(());
            }
        };

        if !self.tracker.should_report(&key, &record) {
            self.metrics.inc_suppressed(WATCHER);
            return Ok(());
        }

        debug!(task = %key, status = record.status.as_str_name(), "Reporting task status");
        let payload = Payload::PodStatus(self.update(pod, &key, &record));
        if let Err(e) = outbox.send(payload, cancel).await {
            self.tracker.remove(&key);
            return Err(e);
        }
        Ok(())
    }

    async fn on_delete(&self, pod: &Pod, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let key = match self.config.task_key(pod) {
            Ok(key) => key,
            Err(_) => return Ok(()),
        };
        let last = self.tracker.last_reported(&key);
        let final_status = derive_pod_status(pod).ok().flatten();

        let record = match (last, final_status) {
            (last, Some(final_status))
                if final_status.is_terminal() && last.as_ref() != Some(&final_status) =>
            {
                final_status
            }
            (Some(last), _) if !last.is_terminal() => {
                PodStatusRecord::new(TaskStatus::Failed, -1, DELETED_BEFORE_COMPLETION)
            }
            _ => {
                self.tracker.remove(&key);
                return Ok(());
            }
        };

        // Kept until queued so the next rebuild reports the task as vanished
        debug!(task = %key, status = record.status.as_str_name(), "Reporting deleted task pod");
        outbox
            .send(Payload::PodStatus(self.update(pod, &key, &record)), cancel)
            .await?;
        self.tracker.remove(&key);
        Ok(())
    }

    /// Re-derive every task from `pods`
    ///
    /// Tasks that disappeared without a terminal report are reported as
    /// deleted before completion.
    async fn rebuild(
        &self,
        pods: Vec<Pod>,
        reason: RebuildReason,
        outbox: &Outbox,
        cancel: &CancellationToken,
    ) -> RelayResult<()> {
        let live: HashSet<TaskKey> = pods
            .iter()
            .filter_map(|p| self.config.task_key(p).ok())
            .collect();

        for (key, last) in self.tracker.entries() {
            if live.contains(&key) {
                continue;
            }
            if last.is_terminal() {
                self.tracker.remove(&key);
                continue;
            }
            let update = PodStatusUpdate {
                workflow_id: key.workflow_id.clone(),
                task_id: key.task_id.clone(),
                retry_id: key.retry_id.clone(),
                status: TaskStatus::Failed as i32,
                exit_code: -1,
                message: DELETED_BEFORE_COMPLETION.to_string(),
                ..Default::default()
            };
            outbox.send(Payload::PodStatus(update), cancel).await?;
            self.tracker.remove(&key);
        }

        for pod in &pods {
            self.on_apply(pod, outbox, cancel).await?;
        }

        self.metrics.inc_rebuild(WATCHER, reason.as_str());
        self.logger.log_rebuild(reason.as_str(), pods.len());
        Ok(())
    }

    async fn watch(&self, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let mut sub = self.cluster.pods(&self.config.selector());
        let initial = sub.wait_for_cache_sync("pod", cancel).await?;
        self.rebuild(initial, RebuildReason::InitialSync, outbox, cancel)
            .await?;

        loop {
            let Some(event) = sub.next_event(cancel).await else {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                return Err(RelayError::WatchClosed("pod watch"));
            };
            match event {
                WatchEvent::Applied(pod) => self.on_apply(&pod, outbox, cancel).await?,
                WatchEvent::Deleted(pod) => self.on_delete(&pod, outbox, cancel).await?,
                WatchEvent::Resynced(pods) => {
                    self.rebuild(pods, RebuildReason::Resync, outbox, cancel)
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
impl DomainWatcher for WorkflowWatcher {
    fn name(&self) -> &'static str {
        WATCHER
    }

    async fn run(&self, outbox: Outbox, cancel: CancellationToken) -> RelayResult<()> {
        finish(self.watch(&outbox, &cancel).await)
    }
}
