//! Sent-event tracker
//!
//! Identical (type, reason, pod) tuples seen again inside the TTL window are
//! suppressed. Repeated scheduling failures and probe warnings otherwise
//! flood the peer; a meaningfully different event that happens to share all
//! three fields is suppressed as well.

use super::{TrackerConfig, TtlTracker};
use std::time::Instant;

/// Deduplication identity of a pod event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub event_type: String,
    pub reason: String,
    pub pod_name: String,
}

impl EventKey {
    pub fn new(
        event_type: impl Into<String>,
        reason: impl Into<String>,
        pod_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            reason: reason.into(),
            pod_name: pod_name.into(),
        }
    }
}

#[derive(Debug)]
pub struct EventTracker {
    inner: TtlTracker<EventKey, ()>,
}

impl EventTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            inner: TtlTracker::new(config.ttl),
        }
    }

    pub fn should_send_at(&self, key: &EventKey, now: Instant) -> bool {
        self.inner.should_report_at(key, &(), now)
    }

    pub fn should_send(&self, key: &EventKey) -> bool {
        self.should_send_at(key, Instant::now())
    }

    /// Forget a key so the next identical event is sent
    pub fn forget(&self, key: &EventKey) {
        self.inner.remove(key);
    }

    /// Forget keys whose window has closed
    pub fn prune_at(&self, now: Instant) -> usize {
        self.inner.prune_expired_at(now)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
