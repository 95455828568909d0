//! In-memory cluster used by watcher tests
//!
//! Each feed keeps its own object map (the "cache") and fans events out to
//! every subscription. `*_silently` mutate the cache without an event, which
//! is how tests simulate a watch gap.

use super::{CacheStore, ClusterWatch, Selector, Subscription, WatchEvent};
use k8s_openapi::api::core::v1::{Event as CoreEvent, Node, Pod};
use kube::ResourceExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

struct FeedStore<K> {
    objects: Arc<RwLock<BTreeMap<String, Arc<K>>>>,
}

impl<K: Send + Sync> CacheStore<K> for FeedStore<K> {
    fn list_current(&self) -> Vec<Arc<K>> {
        self.objects.read().values().cloned().collect()
    }
}

pub struct FakeFeed<K> {
    objects: Arc<RwLock<BTreeMap<String, Arc<K>>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WatchEvent<K>>>>,
}

impl<K> FakeFeed<K>
where
    K: ResourceExt + Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn broadcast(&self, event: WatchEvent<K>) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// New subscription; its first event is the current listing
    pub fn subscribe(&self) -> Subscription<K> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listing = self.list();
        let _ = tx.send(WatchEvent::Resynced(listing));
        self.subscribers.lock().push(tx);
        Subscription {
            events: Box::pin(UnboundedReceiverStream::new(rx)),
            store: Arc::new(FeedStore {
                objects: Arc::clone(&self.objects),
            }),
        }
    }

    pub fn list(&self) -> Vec<K> {
        self.objects
            .read()
            .values()
            .map(|obj| K::clone(obj))
            .collect()
    }

    pub fn apply(&self, obj: K) {
        self.apply_silently(obj.clone());
        self.broadcast(WatchEvent::Applied(obj));
    }

    pub fn delete(&self, obj: K) {
        self.delete_silently(&obj);
        self.broadcast(WatchEvent::Deleted(obj));
    }

    pub fn apply_silently(&self, obj: K) {
        self.objects.write().insert(object_key(&obj), Arc::new(obj));
    }

    pub fn delete_silently(&self, obj: &K) {
        self.objects.write().remove(&object_key(obj));
    }

    /// Relist: deliver the whole cache
    pub fn resync(&self) {
        let listing = self.list();
        self.broadcast(WatchEvent::Resynced(listing));
    }

    pub fn gap(&self, reason: &str) {
        self.broadcast(WatchEvent::Gap(reason.to_string()));
    }

    /// Drop every subscription's sender, ending their streams
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

pub struct FakeCluster {
    pub pod_feed: FakeFeed<Pod>,
    pub node_feed: FakeFeed<Node>,
    pub event_feed: FakeFeed<CoreEvent>,
    selectors: Mutex<Vec<Selector>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            pod_feed: FakeFeed::new(),
            node_feed: FakeFeed::new(),
            event_feed: FakeFeed::new(),
            selectors: Mutex::new(Vec::new()),
        }
    }

    /// Selectors passed to every subscription so far
    pub fn selectors(&self) -> Vec<Selector> {
        self.selectors.lock().clone()
    }
}

impl ClusterWatch for FakeCluster {
    fn pods(&self, selector: &Selector) -> Subscription<Pod> {
        self.selectors.lock().push(selector.clone());
        self.pod_feed.subscribe()
    }

    fn nodes(&self, selector: &Selector) -> Subscription<Node> {
        self.selectors.lock().push(selector.clone());
        self.node_feed.subscribe()
    }

    fn events(&self, selector: &Selector) -> Subscription<CoreEvent> {
        self.selectors.lock().push(selector.clone());
        self.event_feed.subscribe()
    }
}
