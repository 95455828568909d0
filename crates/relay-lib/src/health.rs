//! Liveness and readiness of one relay process
//!
//! The streaming session reports its state and per-component trouble here.
//! Liveness additionally fails once the progress sink has been idle for
//! longer than its staleness bound; readiness follows the session.

use crate::progress::ProgressSink;
use crate::sync::SessionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// The domain watcher and its cluster subscription
    Watcher,
    /// Backend registration
    Backend,
    /// The acknowledgement stream
    Stream,
    /// Liveness side file
    Progress,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Watcher => "watcher",
            Component::Backend => "backend",
            Component::Stream => "stream",
            Component::Progress => "progress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Retrying; the relay is expected to recover on its own
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the component entered this status
    pub since: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: Utc::now(),
        }
    }
}

/// Body of the liveness probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub session: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_progress: Option<DateTime<Utc>>,
    pub components: BTreeMap<&'static str, ComponentHealth>,
}

/// Body of the readiness probe
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct RegistryState {
    components: BTreeMap<Component, ComponentHealth>,
    session: SessionState,
    streamed: bool,
    stopping: bool,
}

#[derive(Debug, Clone)]
struct ProgressCheck {
    sink: Arc<ProgressSink>,
    stale_after: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
    progress: Option<ProgressCheck>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Registry with watcher, backend and stream all healthy
    pub fn new() -> Self {
        let components = [Component::Watcher, Component::Backend, Component::Stream]
            .into_iter()
            .map(|c| (c, ComponentHealth::new(ComponentStatus::Healthy, None)))
            .collect();
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                components,
                session: SessionState::Disconnected,
                streamed: false,
                stopping: false,
            })),
            progress: None,
        }
    }

    /// Fail liveness once `sink` has been idle for longer than `stale_after`
    pub fn with_progress(mut self, sink: Arc<ProgressSink>, stale_after: Duration) -> Self {
        self.progress = Some(ProgressCheck { sink, stale_after });
        self
    }

    /// Record a session state transition
    pub async fn session_state(&self, session: SessionState) {
        let mut state = self.state.write().await;
        state.session = session;
        if session == SessionState::Streaming {
            state.streamed = true;
            // Every stream starts a fresh watcher
            for component in [Component::Stream, Component::Watcher] {
                state
                    .components
                    .insert(component, ComponentHealth::new(ComponentStatus::Healthy, None));
            }
        }
    }

    pub async fn recovered(&self, component: Component) {
        self.set(component, ComponentStatus::Healthy, None).await;
    }

    /// Mark `component` as retrying after `reason`
    pub async fn retrying(&self, component: Component, reason: impl Into<String>) {
        self.set(component, ComponentStatus::Degraded, Some(reason.into()))
            .await;
    }

    /// Mark `component` as failed; liveness reports unhealthy until it recovers
    pub async fn failed(&self, component: Component, reason: impl Into<String>) {
        self.set(component, ComponentStatus::Unhealthy, Some(reason.into()))
            .await;
    }

    async fn set(&self, component: Component, status: ComponentStatus, message: Option<String>) {
        let mut state = self.state.write().await;
        // Keep `since` while the status and message are unchanged
        if let Some(current) = state.components.get(&component) {
            if current.status == status && current.message == message {
                return;
            }
        }
        state
            .components
            .insert(component, ComponentHealth::new(status, message));
    }

    /// Readiness is dropped for good once shutdown begins
    pub async fn stopping(&self) {
        self.state.write().await.stopping = true;
    }

    pub async fn report(&self) -> HealthReport {
        let state = self.state.read().await;
        let mut components: BTreeMap<&'static str, ComponentHealth> = state
            .components
            .iter()
            .map(|(c, h)| (c.as_str(), h.clone()))
            .collect();

        let last_progress = self.progress.as_ref().and_then(|p| p.sink.last_progress());
        if let Some(check) = &self.progress {
            let health = if check.sink.is_stale(check.stale_after) {
                let since = last_progress
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "startup".to_string());
                ComponentHealth::new(
                    ComponentStatus::Unhealthy,
                    Some(format!("no progress since {}", since)),
                )
            } else {
                ComponentHealth::new(ComponentStatus::Healthy, None)
            };
            components.insert(Component::Progress.as_str(), health);
        }

        let status = components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);

        HealthReport {
            status,
            session: state.session.as_str(),
            last_progress,
            components,
        }
    }

    /// Ready once the first stream opened, until shutdown or a failed component
    pub async fn readiness(&self) -> ReadinessReport {
        let (streamed, stopping) = {
            let state = self.state.read().await;
            (state.streamed, state.stopping)
        };
        let reason = if stopping {
            Some("shutting down".to_string())
        } else if !streamed {
            Some("no stream established yet".to_string())
        } else {
            let report = self.report().await;
            report
                .components
                .iter()
                .find(|(_, h)| h.status == ComponentStatus::Unhealthy)
                .map(|(name, _)| format!("{} unhealthy", name))
        };

        ReadinessReport {
            ready: reason.is_none(),
            reason,
        }
    }
}
