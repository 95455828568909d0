//! Node resource-state tracker keyed by hostname

use super::{TrackerConfig, TtlTracker};
use crate::models::NodeSnapshot;
use std::collections::HashSet;
use std::time::Instant;

#[derive(Debug)]
pub struct NodeStateTracker {
    inner: TtlTracker<String, NodeSnapshot>,
}

impl NodeStateTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            inner: TtlTracker::new(config.ttl),
        }
    }

    /// Whether `snapshot` differs from the last report or the window elapsed
    pub fn should_report_at(&self, snapshot: &NodeSnapshot, now: Instant) -> bool {
        self.inner.should_report_at(&snapshot.hostname, snapshot, now)
    }

    pub fn should_report(&self, snapshot: &NodeSnapshot) -> bool {
        self.should_report_at(snapshot, Instant::now())
    }

    /// Forget a node; returns whether it was known
    pub fn remove(&self, hostname: &str) -> bool {
        self.inner.remove(&hostname.to_string()).is_some()
    }

    /// Tracked hostnames missing from `live`, sorted
    ///
    /// Entries stay tracked until their tombstone is queued and the caller
    /// removes them.
    pub fn departed(&self, live: &HashSet<String>) -> Vec<String> {
        let mut gone: Vec<String> = self
            .inner
            .keys()
            .into_iter()
            .filter(|h| !live.contains(h))
            .collect();
        gone.sort();
        gone
    }

    /// Every hostname currently tracked, sorted
    pub fn hostnames(&self) -> Vec<String> {
        let mut hosts = self.inner.keys();
        hosts.sort();
        hosts
    }

    pub fn get(&self, hostname: &str) -> Option<NodeSnapshot> {
        self.inner.get(&hostname.to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snapshot(host: &str, available: bool) -> NodeSnapshot {
        let mut s = NodeSnapshot::tombstone(host);
        s.deleted = false;
        s.available = available;
        s.conditions = vec!["Ready".to_string()];
        s
    }

    #[test]
    fn test_identical_snapshot_suppressed_until_ttl() {
        let tracker = NodeStateTracker::new(&TrackerConfig {
            ttl: Duration::from_secs(300),
        });
        let now = Instant::now();
        let node = snapshot("node-a", true);

        assert!(tracker.should_report_at(&node, now));
        assert!(!tracker.should_report_at(&node, now + Duration::from_secs(10)));
        assert!(tracker.should_report_at(&node, now + Duration::from_secs(301)));
    }

    #[test]
    fn test_changed_snapshot_reported_immediately() {
        let tracker = NodeStateTracker::new(&TrackerConfig::default());
        let now = Instant::now();

        assert!(tracker.should_report_at(&snapshot("node-a", true), now));
        assert!(tracker.should_report_at(&snapshot("node-a", false), now));
        assert!(!tracker.get("node-a").unwrap().available);
    }

    #[test]
    fn test_departed_lists_gone_nodes_without_forgetting_them() {
        let tracker = NodeStateTracker::new(&TrackerConfig::default());
        tracker.should_report(&snapshot("node-a", true));
        tracker.should_report(&snapshot("node-b", true));
        tracker.should_report(&snapshot("node-c", true));

        let live: HashSet<String> = ["node-b".to_string()].into_iter().collect();
        let gone = tracker.departed(&live);

        assert_eq!(gone, vec!["node-a".to_string(), "node-c".to_string()]);
        assert_eq!(tracker.len(), 3);
        assert!(tracker.remove("node-b"));
        assert!(!tracker.remove("node-b"));
    }
}
