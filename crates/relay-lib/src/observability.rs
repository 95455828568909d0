//! Observability infrastructure for the relay agent
//!
//! Provides:
//! - Prometheus metrics (envelope flow, unacknowledged backlog, reconnects, rebuilds)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    GaugeVec, HistogramVec, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for session lifetimes (in seconds)
const SESSION_BUCKETS: &[f64] = &[1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 21600.0, 86400.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RelayMetricsInner> = OnceLock::new();

struct RelayMetricsInner {
    envelopes_enqueued: IntCounterVec,
    envelopes_sent: IntCounterVec,
    envelopes_acked: IntCounterVec,
    unacked_messages: IntGaugeVec,
    oldest_unacked_age_seconds: GaugeVec,
    reports_suppressed: IntCounterVec,
    malformed_objects: IntCounterVec,
    state_rebuilds: IntCounterVec,
    session_reconnects: IntCounterVec,
    session_duration_seconds: HistogramVec,
}

impl RelayMetricsInner {
    fn new() -> Self {
        Self {
            envelopes_enqueued: register_int_counter_vec!(
                "cluster_relay_envelopes_enqueued_total",
                "Envelopes produced by a watcher onto its send queue",
                &["watcher", "kind"]
            )
            .expect("Failed to register envelopes_enqueued"),

            envelopes_sent: register_int_counter_vec!(
                "cluster_relay_envelopes_sent_total",
                "Envelopes written to the backend stream",
                &["watcher"]
            )
            .expect("Failed to register envelopes_sent"),

            envelopes_acked: register_int_counter_vec!(
                "cluster_relay_envelopes_acked_total",
                "Acknowledgements received from the backend",
                &["watcher"]
            )
            .expect("Failed to register envelopes_acked"),

            unacked_messages: register_int_gauge_vec!(
                "cluster_relay_unacked_messages",
                "Sent envelopes still awaiting acknowledgement",
                &["watcher"]
            )
            .expect("Failed to register unacked_messages"),

            oldest_unacked_age_seconds: register_gauge_vec!(
                "cluster_relay_oldest_unacked_age_seconds",
                "Age of the oldest envelope awaiting acknowledgement, 0 when none",
                &["watcher"]
            )
            .expect("Failed to register oldest_unacked_age_seconds"),

            reports_suppressed: register_int_counter_vec!(
                "cluster_relay_reports_suppressed_total",
                "Changes suppressed by a deduplication tracker",
                &["watcher"]
            )
            .expect("Failed to register reports_suppressed"),

            malformed_objects: register_int_counter_vec!(
                "cluster_relay_malformed_objects_total",
                "Cluster objects skipped because they could not be converted",
                &["watcher"]
            )
            .expect("Failed to register malformed_objects"),

            state_rebuilds: register_int_counter_vec!(
                "cluster_relay_state_rebuilds_total",
                "Full rebuilds of tracked state from the watch cache",
                &["watcher", "reason"]
            )
            .expect("Failed to register state_rebuilds"),

            session_reconnects: register_int_counter_vec!(
                "cluster_relay_session_reconnects_total",
                "Streaming sessions that ended and were retried",
                &["watcher"]
            )
            .expect("Failed to register session_reconnects"),

            session_duration_seconds: register_histogram_vec!(
                "cluster_relay_session_duration_seconds",
                "Lifetime of streaming sessions",
                &["watcher"],
                SESSION_BUCKETS.to_vec()
            )
            .expect("Failed to register session_duration_seconds"),
        }
    }
}

/// Relay metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    _private: (),
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RelayMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RelayMetricsInner {
        GLOBAL_METRICS.get_or_init(RelayMetricsInner::new)
    }

    pub fn inc_enqueued(&self, watcher: &str, kind: &str) {
        self.inner()
            .envelopes_enqueued
            .with_label_values(&[watcher, kind])
            .inc();
    }

    pub fn inc_sent(&self, watcher: &str) {
        self.inner().envelopes_sent.with_label_values(&[watcher]).inc();
    }

    pub fn inc_acked(&self, watcher: &str) {
        self.inner().envelopes_acked.with_label_values(&[watcher]).inc();
    }

    pub fn set_unacked(&self, watcher: &str, count: usize) {
        self.inner()
            .unacked_messages
            .with_label_values(&[watcher])
            .set(count as i64);
    }

    pub fn set_oldest_unacked_age(&self, watcher: &str, age: Option<Duration>) {
        self.inner()
            .oldest_unacked_age_seconds
            .with_label_values(&[watcher])
            .set(age.map_or(0.0, |a| a.as_secs_f64()));
    }

    pub fn inc_suppressed(&self, watcher: &str) {
        self.inner()
            .reports_suppressed
            .with_label_values(&[watcher])
            .inc();
    }

    pub fn inc_malformed(&self, watcher: &str) {
        self.inner()
            .malformed_objects
            .with_label_values(&[watcher])
            .inc();
    }

    pub fn inc_rebuild(&self, watcher: &str, reason: &str) {
        self.inner()
            .state_rebuilds
            .with_label_values(&[watcher, reason])
            .inc();
    }

    pub fn inc_reconnect(&self, watcher: &str) {
        self.inner()
            .session_reconnects
            .with_label_values(&[watcher])
            .inc();
    }

    pub fn observe_session(&self, watcher: &str, lifetime: Duration) {
        self.inner()
            .session_duration_seconds
            .with_label_values(&[watcher])
            .observe(lifetime.as_secs_f64());
    }
}

/// Structured logger for relay lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    agent_id: String,
    watcher: String,
}

impl StructuredLogger {
    pub fn new(agent_id: impl Into<String>, watcher: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            watcher: watcher.into(),
        }
    }

    pub fn log_startup(&self, version: &str, cluster_uid: &str) {
        info!(
            event = "agent_started",
            agent_id = %self.agent_id,
            watcher = %self.watcher,
            agent_version = %version,
            cluster_uid = %cluster_uid,
            "Cluster relay started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            agent_id = %self.agent_id,
            watcher = %self.watcher,
            reason = %reason,
            "Cluster relay shutting down"
        );
    }

    /// Log the end of a streaming session and what ended it
    pub fn log_session_end(&self, outcome: &str, lifetime: Duration, unacked: usize) {
        if outcome == "cancelled" {
            info!(
                event = "session_ended",
                watcher = %self.watcher,
                outcome = %outcome,
                lifetime_secs = lifetime.as_secs(),
                unacked = unacked,
                "Streaming session closed"
            );
        } else {
            warn!(
                event = "session_ended",
                watcher = %self.watcher,
                outcome = %outcome,
                lifetime_secs = lifetime.as_secs(),
                unacked = unacked,
                "Streaming session ended, reconnecting"
            );
        }
    }

    pub fn log_rebuild(&self, reason: &str, objects: usize) {
        info!(
            event = "state_rebuilt",
            watcher = %self.watcher,
            reason = %reason,
            objects = objects,
            "Rebuilt tracked state from watch cache"
        );
    }

    pub fn log_capacity_exhausted(&self, capacity: usize) {
        error!(
            event = "unacked_capacity_exhausted",
            watcher = %self.watcher,
            capacity = capacity,
            "Unacknowledged queue is full, forcing reconnect"
        );
    }
}
