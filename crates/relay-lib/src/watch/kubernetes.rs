//! Kubernetes implementation of the cluster watch capability
//!
//! Each subscription is a kube runtime watcher feeding a reflector store.
//! Initial lists and relists arrive as `Resynced`; watch errors arrive as
//! `Gap` and the stream keeps going under kube's default backoff.

use super::{CacheStore, ClusterWatch, Selector, Subscription, WatchEvent};
use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event as CoreEvent, Namespace, Node, Pod};
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Event;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;

impl<K> CacheStore<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn list_current(&self) -> Vec<Arc<K>> {
        self.state()
    }
}

/// Cluster watch backed by the API server
#[derive(Clone)]
pub struct KubeWatch {
    client: Client,
}

impl KubeWatch {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config or the local kubeconfig
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn subscribe<K>(&self, api: Api<K>, selector: &Selector) -> Subscription<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let mut config = watcher::Config::default();
        if let Some(labels) = &selector.labels {
            config = config.labels(labels);
        }
        if let Some(fields) = &selector.fields {
            config = config.fields(fields);
        }

        let (reader, writer) = reflector::store();
        let events = reflector(writer, watcher(api, config))
            .default_backoff()
            .map(|event| match event {
                Ok(Event::Applied(obj)) => WatchEvent::Applied(obj),
                Ok(Event::Deleted(obj)) => WatchEvent::Deleted(obj),
                Ok(Event::Restarted(objs)) => WatchEvent::Resynced(objs),
                Err(e) => WatchEvent::Gap(e.to_string()),
            })
            .boxed();

        Subscription {
            events,
            store: Arc::new(reader),
        }
    }
}

impl ClusterWatch for KubeWatch {
    fn pods(&self, selector: &Selector) -> Subscription<Pod> {
        let api = match &selector.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        self.subscribe(api, selector)
    }

    fn nodes(&self, selector: &Selector) -> Subscription<Node> {
        self.subscribe(Api::all(self.client.clone()), selector)
    }

    fn events(&self, selector: &Selector) -> Subscription<CoreEvent> {
        let api = match &selector.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        self.subscribe(api, selector)
    }
}

/// UID of the `kube-system` namespace, used as the cluster identity
pub async fn cluster_uid(client: &Client) -> Result<String> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = namespaces
        .get("kube-system")
        .await
        .context("Failed to read kube-system namespace")?;
    ns.metadata
        .uid
        .ok_or_else(|| anyhow::anyhow!("kube-system namespace has no uid"))
}
