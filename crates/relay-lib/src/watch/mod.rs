//! Cluster watch capability
//!
//! Watchers consume cluster objects as a stream of [`WatchEvent`]s backed
//! by a local cache. The Kubernetes implementation lives in [`kubernetes`]; tests
//! drive watchers through an in-memory feed instead.

mod kubernetes;

#[cfg(test)]
pub(crate) mod fake;

pub use self::kubernetes::{cluster_uid, KubeWatch};

use crate::error::{RelayError, RelayResult};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Event as CoreEvent, Node, Pod};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One change delivered by a watch
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Object added or updated
    Applied(K),
    /// Object removed
    Deleted(K),
    /// Full listing; the cache now holds exactly these objects
    Resynced(Vec<K>),
    /// The watch broke and events may have been missed
    Gap(String),
}

pub type EventStream<K> = Pin<Box<dyn Stream<Item = WatchEvent<K>> + Send>>;

/// Read access to the local cache behind a watch
pub trait CacheStore<K>: Send + Sync {
    fn list_current(&self) -> Vec<Arc<K>>;
}

/// Label/field scoping of a watch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub namespace: Option<String>,
    pub labels: Option<String>,
    pub fields: Option<String>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn labels(mut self, labels: impl Into<String>) -> Self {
        self.labels = Some(labels.into());
        self
    }

    pub fn fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = Some(fields.into());
        self
    }
}

/// Event stream plus the cache it keeps up to date
pub struct Subscription<K> {
    pub events: EventStream<K>,
    pub store: Arc<dyn CacheStore<K>>,
}

impl<K: Clone> Subscription<K> {
    /// Wait for the initial listing and return it
    ///
    /// Gaps before the first listing are logged and waited out.
    pub async fn wait_for_cache_sync(
        &mut self,
        kind: &'static str,
        cancel: &CancellationToken,
    ) -> RelayResult<Vec<K>> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                next = self.events.next() => next,
            };
            match next {
                Some(WatchEvent::Resynced(objects)) => return Ok(objects),
                Some(WatchEvent::Gap(reason)) => {
                    warn!(kind, reason = %reason, "Watch error before initial sync");
                }
                Some(_) => {}
                None => return Err(RelayError::WatchClosed(kind)),
            }
        }
    }

    /// Current cache contents, cloned out of the store
    pub fn snapshot(&self) -> Vec<K> {
        self.store
            .list_current()
            .iter()
            .map(|obj| K::clone(obj))
            .collect()
    }

    /// Next event, `None` once cancelled
    pub async fn next_event(&mut self, cancel: &CancellationToken) -> Option<WatchEvent<K>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = self.events.next() => next,
        }
    }
}

/// Source of cluster subscriptions
pub trait ClusterWatch: Send + Sync {
    fn pods(&self, selector: &Selector) -> Subscription<Pod>;
    fn nodes(&self, selector: &Selector) -> Subscription<Node>;
    fn events(&self, selector: &Selector) -> Subscription<CoreEvent>;
}

#[cfg(test)]
mod tests {
    use super::fake::FakeCluster;
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_selector_builder() {
        let selector = Selector::all()
            .namespace("workflows")
            .labels("app=task")
            .fields("status.phase=Running");
        assert_eq!(selector.namespace.as_deref(), Some("workflows"));
        assert_eq!(selector.labels.as_deref(), Some("app=task"));
        assert_eq!(selector.fields.as_deref(), Some("status.phase=Running"));
    }

    #[tokio::test]
    async fn test_wait_for_cache_sync_returns_initial_listing() {
        let cluster = FakeCluster::new();
        cluster.node_feed.apply(node("a"));
        cluster.node_feed.apply(node("b"));

        let cancel = CancellationToken::new();
        let mut sub = cluster.nodes(&Selector::all());
        let initial = sub.wait_for_cache_sync("node", &cancel).await.unwrap();
        assert_eq!(initial.len(), 2);
        assert_eq!(sub.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_cache_sync_honours_cancellation() {
        let cluster = FakeCluster::new();
        let cancel = CancellationToken::new();
        let mut sub = cluster.nodes(&Selector::all());
        sub.wait_for_cache_sync("node", &cancel).await.unwrap();

        cancel.cancel();
        assert!(sub.next_event(&cancel).await.is_none());
    }
}
