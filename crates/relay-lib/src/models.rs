//! Core data models for the relay agent

use crate::proto::{self, TaskStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Node taint as reported to the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTaint {
    pub key: String,
    pub value: String,
    pub effect: String,
    pub time_added: Option<DateTime<Utc>>,
}

/// Point-in-time view of a node, rebuilt on every watch callback
///
/// Maps are ordered so two snapshots of the same node compare equal
/// regardless of the order the API server returned fields in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub hostname: String,
    pub available: bool,
    /// Types of the conditions currently asserted true
    pub conditions: Vec<String>,
    /// cpu in millicores, memory and ephemeral-storage in KiB, accelerators as counts
    pub allocatable: BTreeMap<String, i64>,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<NodeTaint>,
    pub deleted: bool,
}

impl NodeSnapshot {
    pub fn to_proto(&self) -> proto::NodeResourceUpdate {
        proto::NodeResourceUpdate {
            hostname: self.hostname.clone(),
            available: self.available,
            conditions: self.conditions.clone(),
            allocatable: self
                .allocatable
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            labels: self
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            taints: self
                .taints
                .iter()
                .map(|t| proto::Taint {
                    key: t.key.clone(),
                    value: t.value.clone(),
                    effect: t.effect.clone(),
                    time_added: t.time_added.map(proto::to_timestamp),
                })
                .collect(),
            deleted: self.deleted,
        }
    }

    /// Snapshot used to tell the peer a node is gone
    pub fn tombstone(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            available: false,
            conditions: Vec::new(),
            allocatable: BTreeMap::new(),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            deleted: true,
        }
    }
}

/// Derived status of a workflow task pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatusRecord {
    pub status: TaskStatus,
    pub exit_code: i32,
    pub message: String,
}

impl PodStatusRecord {
    pub fn new(status: TaskStatus, exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            exit_code,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// cpu/memory/storage/accelerator tuple used by the usage aggregator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceTuple {
    pub cpu_millis: i64,
    pub memory_kib: i64,
    pub storage_kib: i64,
    pub accelerators: i64,
}

impl ResourceTuple {
    pub fn add(&mut self, other: &ResourceTuple) {
        self.cpu_millis += other.cpu_millis;
        self.memory_kib += other.memory_kib;
        self.storage_kib += other.storage_kib;
        self.accelerators += other.accelerators;
    }

    pub fn subtract(&mut self, other: &ResourceTuple) {
        self.cpu_millis -= other.cpu_millis;
        self.memory_kib -= other.memory_kib;
        self.storage_kib -= other.storage_kib;
        self.accelerators -= other.accelerators;
    }

    /// Component-wise maximum
    pub fn max(&self, other: &ResourceTuple) -> ResourceTuple {
        ResourceTuple {
            cpu_millis: self.cpu_millis.max(other.cpu_millis),
            memory_kib: self.memory_kib.max(other.memory_kib),
            storage_kib: self.storage_kib.max(other.storage_kib),
            accelerators: self.accelerators.max(other.accelerators),
        }
    }

    /// True when every component of `self` is at least the one in `other`
    pub fn dominates(&self, other: &ResourceTuple) -> bool {
        self.cpu_millis >= other.cpu_millis
            && self.memory_kib >= other.memory_kib
            && self.storage_kib >= other.storage_kib
            && self.accelerators >= other.accelerators
    }

    pub fn is_zero(&self) -> bool {
        *self == ResourceTuple::default()
    }
}

/// Resources a single pod contributes to its node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodContribution {
    pub node_name: String,
    pub namespace: String,
    pub resources: ResourceTuple,
}

/// Namespace/name identity of a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_tuple_arithmetic() {
        let mut total = ResourceTuple::default();
        let pod = ResourceTuple {
            cpu_millis: 500,
            memory_kib: 1024,
            storage_kib: 2048,
            accelerators: 1,
        };

        total.add(&pod);
        total.add(&pod);
        assert_eq!(total.cpu_millis, 1000);
        assert!(total.dominates(&pod));

        total.subtract(&pod);
        total.subtract(&pod);
        assert!(total.is_zero());
    }

    #[test]
    fn test_node_snapshot_to_proto() {
        let mut snapshot = NodeSnapshot::tombstone("node-a");
        snapshot.deleted = false;
        snapshot.allocatable.insert("cpu".to_string(), 4000);
        snapshot.taints.push(NodeTaint {
            key: "dedicated".to_string(),
            value: "gpu".to_string(),
            effect: "NoSchedule".to_string(),
            time_added: None,
        });

        let proto = snapshot.to_proto();
        assert_eq!(proto.hostname, "node-a");
        assert_eq!(proto.allocatable.get("cpu"), Some(&4000));
        assert_eq!(proto.taints[0].effect, "NoSchedule");
        assert!(!proto.deleted);
    }
}
