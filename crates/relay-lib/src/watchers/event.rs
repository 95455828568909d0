//! Pod event relay
//!
//! Only events about pods are relayed. Repeats of the same (type, reason,
//! pod) inside the tracker window are dropped.

use super::{finish, skip_malformed, DomainWatcher, RebuildReason};
use crate::error::{RelayError, RelayResult};
use crate::observability::{RelayMetrics, StructuredLogger};
use crate::proto::{to_timestamp, Payload, PodEvent};
use crate::sync::Outbox;
use crate::tracker::{EventKey, EventTracker, TrackerConfig};
use crate::watch::{ClusterWatch, Selector, WatchEvent};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event as CoreEvent;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WATCHER: &str = "event";

#[derive(Debug, Clone)]
pub struct EventWatcherConfig {
    pub namespace: Option<String>,
    pub tracker: TrackerConfig,
    /// How often closed dedup windows are forgotten
    pub prune_interval: Duration,
}

impl Default for EventWatcherConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            tracker: TrackerConfig {
                ttl: Duration::from_secs(600),
            },
            prune_interval: Duration::from_secs(60),
        }
    }
}

impl EventWatcherConfig {
    pub fn selector(&self) -> Selector {
        let selector = Selector::all().fields("involvedObject.kind=Pod");
        match &self.namespace {
            Some(ns) => selector.namespace(ns.clone()),
            None => selector,
        }
    }
}

/// Convert a cluster event into a pod event, `None` if it is not about a pod
pub fn to_pod_event(event: &CoreEvent) -> RelayResult<Option<PodEvent>> {
    let involved = &event.involved_object;
    if involved.kind.as_deref() != Some("Pod") {
        return Ok(None);
    }
    let pod_name = involved
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| RelayError::malformed("event", event.name_any(), "involved pod has no name"))?;

    let last_seen = event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0));
    let source_component = event
        .source
        .as_ref()
        .and_then(|s| s.component.clone())
        .or_else(|| event.reporting_component.clone())
        .unwrap_or_default();

    Ok(Some(PodEvent {
        namespace: involved
            .namespace
            .clone()
            .or_else(|| event.namespace())
            .unwrap_or_default(),
        pod_name,
        event_type: event.type_.clone().unwrap_or_default(),
        reason: event.reason.clone().unwrap_or_default(),
        message: event.message.clone().unwrap_or_default(),
        count: event.count.unwrap_or(1),
        first_seen: event.first_timestamp.as_ref().map(|t| to_timestamp(t.0)),
        last_seen: last_seen.map(to_timestamp),
        source_component,
    }))
}

pub struct EventWatcher {
    cluster: Arc<dyn ClusterWatch>,
    config: EventWatcherConfig,
    tracker: EventTracker,
    metrics: RelayMetrics,
    logger: StructuredLogger,
}

impl EventWatcher {
    pub fn new(cluster: Arc<dyn ClusterWatch>, config: EventWatcherConfig, agent_id: &str) -> Self {
        Self {
            cluster,
            tracker: EventTracker::new(&config.tracker),
            config,
            metrics: RelayMetrics::new(),
            logger: StructuredLogger::new(agent_id, WATCHER),
        }
    }

    pub fn tracker(&self) -> &EventTracker {
        &self.tracker
    }

    async fn on_apply(&self, event: &CoreEvent, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let pod_event = match to_pod_event(event) {
            Ok(Some(pod_event)) => pod_event,
            Ok(None) => return Ok(()),
            Err(e) => {
                skip_malformed(&self.metrics, WATCHER, &e);
                return Ok(());
            }
        };

        let key = EventKey::new(
            pod_event.event_type.clone(),
            pod_event.reason.clone(),
            pod_event.pod_name.clone(),
        );
        if !self.tracker.should_send(&key) {
            self.metrics.inc_suppressed(WATCHER);
            return Ok(());
        }

        debug!(
            pod = %pod_event.pod_name,
            reason = %pod_event.reason,
            "Relaying pod event"
        );
        if let Err(e) = outbox.send(Payload::PodEvent(pod_event), cancel).await {
            self.tracker.forget(&key);
            return Err(e);
        }
        Ok(())
    }

    async fn rebuild(
        &self,
        events: Vec<CoreEvent>,
        reason: RebuildReason,
        outbox: &Outbox,
        cancel: &CancellationToken,
    ) -> RelayResult<()> {
        self.tracker.prune_at(Instant::now());
        for event in &events {
            self.on_apply(event, outbox, cancel).await?;
        }
        self.metrics.inc_rebuild(WATCHER, reason.as_str());
        self.logger.log_rebuild(reason.as_str(), events.len());
        Ok(())
    }

    async fn watch(&self, outbox: &Outbox, cancel: &CancellationToken) -> RelayResult<()> {
        let mut sub = self.cluster.events(&self.config.selector());
        let initial = sub.wait_for_cache_sync("event", cancel).await?;
        self.rebuild(initial, RebuildReason::InitialSync, outbox, cancel)
            .await?;

        let mut prune = tokio::time::interval(self.config.prune_interval);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                event = sub.next_event(cancel) => event,
                _ = prune.tick() => {
                    let pruned = self.tracker.prune_at(Instant::now());
                    if pruned > 0 {
                        debug!(pruned, remaining = self.tracker.len(), "Pruned event windows");
                    }
                    continue;
                }
            };
            let Some(event) = event else {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                return Err(RelayError::WatchClosed("event watch"));
            };

            match event {
                WatchEvent::Applied(ev) => self.on_apply(&ev, outbox, cancel).await?,
                // Expired events need no report
                WatchEvent::Deleted(_) => {}
                WatchEvent::Resynced(events) => {
                    self.rebuild(events, RebuildReason::Resync, outbox, cancel)
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
impl DomainWatcher for EventWatcher {
    fn name(&self) -> &'static str {
        WATCHER
    }

    async fn run(&self, outbox: Outbox, cancel: CancellationToken) -> RelayResult<()> {
        finish(self.watch(&outbox, &cancel).await)
    }
}
