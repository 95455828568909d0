//! Per-node resource usage aggregation
//!
//! Running totals are derived from pod resource requests and updated
//! incrementally by adding and subtracting pod contributions. Two parallel
//! aggregates are kept per node: the total, and the share coming from pods
//! outside the managed namespaces. Totals are only recomputed from scratch on
//! an explicit [`NodeUsageAggregator::rebuild`].

use crate::models::{PodContribution, PodKey, ResourceTuple};
use crate::proto;
use crate::quantity::{kib_to_mib_ceil, millis_to_cores_ceil};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Both aggregates for one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeTotals {
    pub total: ResourceTuple,
    pub non_managed: ResourceTuple,
    pub pod_count: usize,
}

/// Reported usage figures, ceiling-rounded, byte quantities with a unit suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageFigures {
    pub cpu: String,
    pub memory: String,
    pub ephemeral_storage: String,
    pub accelerators: String,
}

impl From<&ResourceTuple> for UsageFigures {
    fn from(r: &ResourceTuple) -> Self {
        Self {
            cpu: millis_to_cores_ceil(r.cpu_millis).to_string(),
            memory: format!("{}Mi", kib_to_mib_ceil(r.memory_kib)),
            ephemeral_storage: format!("{}Mi", kib_to_mib_ceil(r.storage_kib)),
            accelerators: r.accelerators.to_string(),
        }
    }
}

impl UsageFigures {
    fn to_proto(&self) -> proto::ResourceUsage {
        proto::ResourceUsage {
            cpu: self.cpu.clone(),
            memory: self.memory.clone(),
            ephemeral_storage: self.ephemeral_storage.clone(),
            accelerators: self.accelerators.clone(),
        }
    }
}

/// Snapshot of a node's usage as reported to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUsage {
    pub hostname: String,
    pub total: UsageFigures,
    pub non_managed: UsageFigures,
}

impl NodeUsage {
    pub fn to_proto(&self) -> proto::NodeUsageUpdate {
        proto::NodeUsageUpdate {
            hostname: self.hostname.clone(),
            total: Some(self.total.to_proto()),
            non_managed: Some(self.non_managed.to_proto()),
        }
    }
}

#[derive(Debug, Default)]
struct AggregatorState {
    pods: HashMap<PodKey, PodContribution>,
    nodes: HashMap<String, NodeTotals>,
    dirty: BTreeSet<String>,
}

impl AggregatorState {
    fn apply(&mut self, contribution: &PodContribution, managed: bool, add: bool) {
        let totals = self
            .nodes
            .entry(contribution.node_name.clone())
            .or_default();
        if add {
            totals.pod_count += 1;
            totals.total.add(&contribution.resources);
            if !managed {
                totals.non_managed.add(&contribution.resources);
            }
        } else {
            totals.pod_count = totals.pod_count.saturating_sub(1);
            totals.total.subtract(&contribution.resources);
            if !managed {
                totals.non_managed.subtract(&contribution.resources);
            }
        }
        debug_assert!(totals.total.dominates(&totals.non_managed));
        self.dirty.insert(contribution.node_name.clone());
    }
}

/// Running per-node totals guarded by a reader/writer lock
#[derive(Debug)]
pub struct NodeUsageAggregator {
    managed_namespaces: HashSet<String>,
    state: RwLock<AggregatorState>,
}

impl NodeUsageAggregator {
    pub fn new(managed_namespaces: impl IntoIterator<Item = String>) -> Self {
        Self {
            managed_namespaces: managed_namespaces.into_iter().collect(),
            state: RwLock::new(AggregatorState::default()),
        }
    }

    fn is_managed(&self, namespace: &str) -> bool {
        self.managed_namespaces.contains(namespace)
    }

    /// Track a pod's contribution
    ///
    /// Re-adding an identical contribution is a no-op. A contribution that
    /// differs (moved node, changed requests) first comes off the old node.
    /// Returns whether any total changed.
    pub fn add_pod(&self, key: PodKey, contribution: PodContribution) -> bool {
        let mut state = self.state.write();
        if let Some(previous) = state.pods.get(&key).cloned() {
            if previous == contribution {
                return false;
            }
            debug!(
                pod = %key,
                from = %previous.node_name,
                to = %contribution.node_name,
                "Superseding pod contribution"
            );
            let managed = self.is_managed(&previous.namespace);
            state.apply(&previous, managed, false);
        }
        let managed = self.is_managed(&contribution.namespace);
        state.apply(&contribution, managed, true);
        state.pods.insert(key, contribution);
        true
    }

    /// Stop tracking a pod; absent pods are ignored
    pub fn delete_pod(&self, key: &PodKey) -> bool {
        let mut state = self.state.write();
        match state.pods.remove(key) {
            Some(previous) => {
                let managed = self.is_managed(&previous.namespace);
                state.apply(&previous, managed, false);
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, key: &PodKey) -> bool {
        self.state.read().pods.contains_key(key)
    }

    /// Formatted usage for `node`; unknown nodes report zero usage
    pub fn get_node_usage(&self, node: &str) -> NodeUsage {
        let totals = self.node_totals(node).unwrap_or_default();
        NodeUsage {
            hostname: node.to_string(),
            total: UsageFigures::from(&totals.total),
            non_managed: UsageFigures::from(&totals.non_managed),
        }
    }

    /// Raw totals for `node`
    pub fn node_totals(&self, node: &str) -> Option<NodeTotals> {
        self.state.read().nodes.get(node).copied()
    }

    /// Nodes changed since the last call, clearing the dirty set
    pub fn take_dirty(&self) -> Vec<String> {
        let mut state = self.state.write();
        let dirty = std::mem::take(&mut state.dirty);
        // Nodes with nothing left on them only need one final zero report
        state.nodes.retain(|_, totals| totals.pod_count > 0);
        dirty.into_iter().collect()
    }

    /// Queue `node` for another report, e.g. after a failed send
    pub fn mark_dirty(&self, node: &str) {
        self.state.write().dirty.insert(node.to_string());
    }

    /// Clear all state for a full rebuild
    pub fn reset(&self) {
        let mut state = self.state.write();
        *state = AggregatorState::default();
    }

    /// Replace all tracked contributions with `pods`
    ///
    /// Every node known before or after the rebuild is marked dirty so nodes
    /// that lost pods during a watch gap get a corrected report.
    pub fn rebuild(&self, pods: impl IntoIterator<Item = (PodKey, PodContribution)>) {
        let mut fresh = AggregatorState::default();
        for (key, contribution) in pods {
            if let Some(previous) = fresh.pods.get(&key).cloned() {
                let managed = self.is_managed(&previous.namespace);
                fresh.apply(&previous, managed, false);
            }
            let managed = self.is_managed(&contribution.namespace);
            fresh.apply(&contribution, managed, true);
            fresh.pods.insert(key, contribution);
        }

        let mut state = self.state.write();
        fresh.dirty.extend(state.nodes.keys().cloned());
        fresh.dirty.extend(state.dirty.iter().cloned());
        *state = fresh;
    }

    /// Sum of every tracked pod contribution
    pub fn tracked_sum(&self) -> ResourceTuple {
        let state = self.state.read();
        let mut sum = ResourceTuple::default();
        for pod in state.pods.values() {
            sum.add(&pod.resources);
        }
        sum
    }

    /// Sum of every node's total aggregate
    pub fn node_sum(&self) -> ResourceTuple {
        let state = self.state.read();
        let mut sum = ResourceTuple::default();
        for totals in state.nodes.values() {
            sum.add(&totals.total);
        }
        sum
    }

    pub fn pod_count(&self) -> usize {
        self.state.read().pods.len()
    }
}
