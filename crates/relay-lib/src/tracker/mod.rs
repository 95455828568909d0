//! TTL-keyed deduplication trackers
//!
//! Each tracker answers one question for its domain: has this entity
//! changed since it was last reported, or has enough time passed that it
//! should be reported again anyway?
//!
//! - [`PodStatusTracker`]: workflow pod status keyed by (workflow, task, retry)
//! - [`NodeStateTracker`]: node resource snapshots keyed by hostname
//! - [`EventTracker`]: pod events keyed by (type, reason, pod)

mod event;
mod node_state;
mod pod_status;

pub use event::{EventKey, EventTracker};
pub use node_state::NodeStateTracker;
pub use pod_status::{PodStatusTracker, TaskKey};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Configuration shared by the trackers
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Window during which an unchanged value is not reported again
    pub ttl: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedEntry<V> {
    value: V,
    reported_at: Instant,
}

/// Map from identity to (last reported value, last reported time)
///
/// The lock is only held for the map operation itself.
#[derive(Debug)]
pub struct TtlTracker<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, TrackedEntry<V>>>,
}

impl<K, V> TtlTracker<K, V>
where
    K: Eq + Hash + Clone,
    V: PartialEq + Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Decide whether `value` must be reported for `key` at `now`
    ///
    /// Returns true (and records the report) when the key is new, the value
    /// differs from the last reported one, or the TTL has elapsed.
    pub fn should_report_at(&self, key: &K, value: &V, now: Instant) -> bool {
        let mut entries = self.entries.write();
        let report = match entries.get(key) {
            None => true,
            Some(entry) => {
                entry.value != *value || now.saturating_duration_since(entry.reported_at) >= self.ttl
            }
        };
        if report {
            entries.insert(
                key.clone(),
                TrackedEntry {
                    value: value.clone(),
                    reported_at: now,
                },
            );
        }
        report
    }

    pub fn should_report(&self, key: &K, value: &V) -> bool {
        self.should_report_at(key, value, Instant::now())
    }

    /// Last reported value for `key`
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key).map(|e| e.value)
    }

    /// Drop every key not accepted by `keep`
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        self.entries.write().retain(|k, _| keep(k));
    }

    /// Drop entries whose last report is older than the TTL window
    pub fn prune_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.reported_at) < self.ttl);
        before - entries.len()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_key_is_reported_once() {
        let tracker: TtlTracker<String, u32> = TtlTracker::new(Duration::from_secs(60));
        let now = Instant::now();

        assert!(tracker.should_report_at(&"a".to_string(), &1, now));
        assert!(!tracker.should_report_at(&"a".to_string(), &1, now + Duration::from_secs(1)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_changed_value_is_reported_within_ttl() {
        let tracker: TtlTracker<&str, u32> = TtlTracker::new(Duration::from_secs(60));
        let now = Instant::now();

        assert!(tracker.should_report_at(&"a", &1, now));
        assert!(tracker.should_report_at(&"a", &2, now));
        assert_eq!(tracker.get(&"a"), Some(2));
    }

    #[test]
    fn test_unchanged_value_is_reported_after_ttl() {
        let tracker: TtlTracker<&str, u32> = TtlTracker::new(Duration::from_secs(60));
        let now = Instant::now();

        assert!(tracker.should_report_at(&"a", &1, now));
        assert!(!tracker.should_report_at(&"a", &1, now + Duration::from_secs(59)));
        assert!(tracker.should_report_at(&"a", &1, now + Duration::from_secs(60)));
        // The window restarts from the last report
        assert!(!tracker.should_report_at(&"a", &1, now + Duration::from_secs(61)));
    }

    #[test]
    fn test_prune_expired() {
        let tracker: TtlTracker<&str, ()> = TtlTracker::new(Duration::from_secs(10));
        let now = Instant::now();

        tracker.should_report_at(&"old", &(), now);
        tracker.should_report_at(&"fresh", &(), now + Duration::from_secs(8));

        assert_eq!(tracker.prune_expired_at(now + Duration::from_secs(12)), 1);
        assert_eq!(tracker.keys(), vec!["fresh"]);
    }

    #[test]
    fn test_remove_and_retain() {
        let tracker: TtlTracker<&str, u32> = TtlTracker::new(Duration::from_secs(10));
        tracker.should_report(&"a", &1);
        tracker.should_report(&"b", &2);
        tracker.should_report(&"c", &3);

        assert_eq!(tracker.remove(&"a"), Some(1));
        assert_eq!(tracker.remove(&"a"), None);

        tracker.retain(|k| *k == "c");
        assert_eq!(tracker.keys(), vec!["c"]);

        tracker.clear();
        assert!(tracker.is_empty());
    }
}
