//! Streaming session lifecycle
//!
//! One session is one attempt at `register → open stream → stream until
//! something ends it`. While streaming, four tasks share a cancellation
//! scope:
//! - receiver: removes acknowledged ids from the unacknowledged queue
//! - heartbeat: keeps the progress sink fresh while the watcher is idle
//! - watcher: turns cluster changes into envelopes on the send queue
//! - sender: moves envelopes from the send queue onto the stream
//!
//! The first task to finish decides how the session ended. The others are
//! cancelled and joined within the grace period, then aborted.

use super::backoff::ExponentialBackoff;
use super::client::{AckStream, RelayTransport};
use super::outbox::{Inbox, Outbox};
use super::unacked::{UnackedQueue, DEFAULT_UNACKED_CAPACITY};
use crate::envelope::EnvelopeFactory;
use crate::error::{RelayError, RelayResult};
use crate::health::{Component, HealthRegistry};
use crate::observability::{RelayMetrics, StructuredLogger};
use crate::progress::ProgressSink;
use crate::proto::{Envelope, InitBackendRequest};
use crate::watchers::DomainWatcher;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for streaming sessions
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Capacity of the watcher → sender queue
    pub send_queue_capacity: usize,
    /// Capacity of the unacknowledged queue
    pub unacked_capacity: usize,
    /// Buffer between the sender task and the transport
    pub outbound_buffer: usize,
    /// How often the heartbeat task checks for idleness
    pub heartbeat_interval: Duration,
    /// Minimum gap between progress file writes on the send path
    pub progress_min_gap: Duration,
    /// Time allowed for session tasks to stop before they are aborted
    pub shutdown_grace: Duration,
    /// First delay between registration attempts
    pub register_initial_backoff: Duration,
    /// Cap on the delay between registration attempts
    pub register_max_backoff: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 1000,
            unacked_capacity: DEFAULT_UNACKED_CAPACITY,
            outbound_buffer: 64,
            heartbeat_interval: Duration::from_secs(15),
            progress_min_gap: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            register_initial_backoff: Duration::from_secs(1),
            register_max_backoff: Duration::from_secs(30),
        }
    }
}

/// Who this agent is, sent with every registration
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_version: String,
    pub cluster_uid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Streaming,
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
        }
    }
}

/// Non-error ways a session can end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The caller's token was cancelled
    Cancelled,
    /// The peer closed the acknowledgement stream cleanly
    PeerClosed,
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::Cancelled => "cancelled",
            SessionEnd::PeerClosed => "peer_closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskRole {
    Receiver,
    Heartbeat,
    Watcher,
    Sender,
}

impl TaskRole {
    fn name(&self) -> &'static str {
        match self {
            TaskRole::Receiver => "receiver",
            TaskRole::Heartbeat => "heartbeat",
            TaskRole::Watcher => "watcher",
            TaskRole::Sender => "sender",
        }
    }
}

type TaskOutcome = (TaskRole, RelayResult<()>);

/// Streaming session for one domain watcher
///
/// The unacknowledged queue and the send queue belong to the session
/// object, not to a single run, so they carry over between reconnects.
pub struct StreamingSession {
    transport: Arc<dyn RelayTransport>,
    config: StreamingConfig,
    identity: AgentIdentity,
    watcher: Arc<dyn DomainWatcher>,
    unacked: Arc<UnackedQueue>,
    outbox: Outbox,
    inbox: Inbox,
    progress: Arc<ProgressSink>,
    metrics: RelayMetrics,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
    state: Mutex<SessionState>,
}

impl StreamingSession {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        watcher: Arc<dyn DomainWatcher>,
        identity: AgentIdentity,
        config: StreamingConfig,
        progress: Arc<ProgressSink>,
    ) -> Self {
        let metrics = RelayMetrics::new();
        let factory = Arc::new(EnvelopeFactory::new(&identity.agent_id));
        let (outbox, inbox) = Outbox::channel(
            config.send_queue_capacity,
            factory,
            watcher.name(),
            metrics.clone(),
        );
        let logger = StructuredLogger::new(&identity.agent_id, watcher.name());
        Self {
            transport,
            unacked: Arc::new(UnackedQueue::new(config.unacked_capacity)),
            config,
            identity,
            watcher,
            outbox,
            inbox,
            progress,
            metrics,
            health: None,
            logger,
            state: Mutex::new(SessionState::Disconnected),
        }
    }

    /// Report component health into `registry`
    pub fn with_health(mut self, registry: HealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn unacked(&self) -> &Arc<UnackedQueue> {
        &self.unacked
    }

    pub fn watcher_name(&self) -> &'static str {
        self.watcher.name()
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    async fn set_state(&self, state: SessionState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            debug!(
                watcher = self.watcher.name(),
                from = current.as_str(),
                to = state.as_str(),
                "Session state change"
            );
            *current = state;
        }
        if let Some(health) = &self.health {
            health.session_state(state).await;
        }
    }

    /// Run one session until it ends
    ///
    /// `Ok` covers cancellation and a clean close by the peer; anything
    /// else is returned as the error that ended the session.
    pub async fn run(&self, cancel: &CancellationToken) -> RelayResult<SessionEnd> {
        self.set_state(SessionState::Connecting).await;
        let result = self.connect_and_stream(cancel).await;
        self.set_state(SessionState::Disconnected).await;
        match result {
            Err(_) if cancel.is_cancelled() => Ok(SessionEnd::Cancelled),
            other => other,
        }
    }

    async fn connect_and_stream(&self, cancel: &CancellationToken) -> RelayResult<SessionEnd> {
        self.register(cancel).await?;

        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let acks = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            opened = self.transport.open_stream(outbound_rx) => opened,
        };
        let acks = match acks {
            Ok(acks) => acks,
            Err(e) => {
                self.health_retrying(Component::Stream, e.to_string()).await;
                return Err(e);
            }
        };

        self.set_state(SessionState::Streaming).await;
        info!(
            watcher = self.watcher.name(),
            unacked = self.unacked.len(),
            "Streaming session established"
        );

        let scope = cancel.child_token();
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        self.spawn_receiver(&mut tasks, acks, scope.clone());
        self.spawn_heartbeat(&mut tasks, scope.clone());

        // Unacknowledged traffic goes out before anything new
        let replayed = tokio::select! {
            _ = scope.cancelled() => Err(RelayError::Cancelled),
            replayed = self.unacked.resend_all(&outbound) => replayed,
        };

        let outcome = match replayed {
            Ok(count) => {
                if count > 0 {
                    info!(
                        watcher = self.watcher.name(),
                        count, "Resent unacknowledged envelopes"
                    );
                }
                self.spawn_watcher(&mut tasks, scope.clone());
                self.spawn_sender(&mut tasks, outbound, scope.clone());
                let first = tasks.join_next().await;
                classify(cancel, first)
            }
            Err(e) => {
                drop(outbound);
                if cancel.is_cancelled() {
                    Ok(SessionEnd::Cancelled)
                } else {
                    Err(e)
                }
            }
        };

        self.set_state(SessionState::Closing).await;
        scope.cancel();
        self.join_with_grace(&mut tasks).await;
        let drained = self.drain_inbox().await;
        if drained > 0 {
            debug!(
                watcher = self.watcher.name(),
                drained, "Moved queued envelopes into the unacknowledged queue"
            );
        }
        self.metrics.set_unacked(self.watcher.name(), self.unacked.len());

        match &outcome {
            Ok(SessionEnd::Cancelled) => {}
            Ok(end) => self.health_retrying(Component::Stream, end.as_str()).await,
            Err(e) => {
                let message = e.to_string();
                match e {
                    RelayError::CapacityExceeded { capacity } => {
                        self.logger.log_capacity_exhausted(*capacity);
                        // The backend stopped acknowledging; cleared by the next stream
                        if let Some(health) = &self.health {
                            health.failed(Component::Stream, message).await;
                        }
                    }
                    RelayError::WatchClosed(_) => {
                        self.health_retrying(Component::Watcher, message).await
                    }
                    _ => self.health_retrying(Component::Stream, message).await,
                }
            }
        }

        outcome
    }

    /// Register with the backend, retrying with backoff until accepted
    async fn register(&self, cancel: &CancellationToken) -> RelayResult<()> {
        let mut backoff = ExponentialBackoff::new(
            self.config.register_initial_backoff,
            self.config.register_max_backoff,
        );
        let request = InitBackendRequest {
            agent_id: self.identity.agent_id.clone(),
            agent_version: self.identity.agent_version.clone(),
            cluster_uid: self.identity.cluster_uid.clone(),
            watcher: self.watcher.name().to_string(),
        };

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                attempt = self.transport.init_backend(request.clone()) => attempt,
            };

            let reason = match attempt {
                Ok(response) if response.accepted => {
                    debug!(watcher = self.watcher.name(), "Registered with backend");
                    if let Some(health) = &self.health {
                        health.recovered(Component::Backend).await;
                    }
                    return Ok(());
                }
                Ok(response) => format!("registration rejected: {}", response.message),
                Err(e) => e.to_string(),
            };

            let delay = backoff.next_delay();
            warn!(
                watcher = self.watcher.name(),
                error = %reason,
                retry_in_ms = delay.as_millis() as u64,
                "Backend registration failed"
            );
            self.health_retrying(Component::Backend, reason).await;

            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn spawn_receiver(
        &self,
        tasks: &mut JoinSet<TaskOutcome>,
        acks: AckStream,
        scope: CancellationToken,
    ) {
        let unacked = Arc::clone(&self.unacked);
        let metrics = self.metrics.clone();
        let watcher = self.watcher.name();
        tasks.spawn(async move {
            let result = receive_acks(acks, &unacked, &metrics, watcher, &scope).await;
            (TaskRole::Receiver, result)
        });
    }

    fn spawn_heartbeat(&self, tasks: &mut JoinSet<TaskOutcome>, scope: CancellationToken) {
        let progress = Arc::clone(&self.progress);
        let unacked = Arc::clone(&self.unacked);
        let metrics = self.metrics.clone();
        let watcher = self.watcher.name();
        let interval = self.config.heartbeat_interval;
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return (TaskRole::Heartbeat, Ok(())),
                    _ = ticker.tick() => {
                        if progress.idle_for() >= interval {
                            if let Err(e) = progress.record().await {
                                warn!(watcher, error = %e, "Failed to write progress file");
                            }
                        }
                        metrics.set_unacked(watcher, unacked.len());
                        metrics.set_oldest_unacked_age(watcher, unacked.oldest_age());
                    }
                }
            }
        });
    }

    fn spawn_watcher(&self, tasks: &mut JoinSet<TaskOutcome>, scope: CancellationToken) {
        let watcher = Arc::clone(&self.watcher);
        let outbox = self.outbox.clone();
        tasks.spawn(async move {
            let result = watcher.run(outbox, scope).await;
            (TaskRole::Watcher, result)
        });
    }

    fn spawn_sender(
        &self,
        tasks: &mut JoinSet<TaskOutcome>,
        outbound: mpsc::Sender<Envelope>,
        scope: CancellationToken,
    ) {
        let forwarder = Forwarder {
            inbox: Arc::clone(&self.inbox),
            unacked: Arc::clone(&self.unacked),
            outbound,
            progress: Arc::clone(&self.progress),
            metrics: self.metrics.clone(),
            watcher: self.watcher.name(),
            progress_min_gap: self.config.progress_min_gap,
        };
        tasks.spawn(async move { (TaskRole::Sender, forwarder.run(&scope).await) });
    }

    async fn join_with_grace(&self, tasks: &mut JoinSet<TaskOutcome>) {
        let graceful = tokio::time::timeout(self.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if graceful.is_err() {
            warn!(
                watcher = self.watcher.name(),
                remaining = tasks.len(),
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Session tasks did not stop in time, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    /// Move everything still in the send queue into the unacknowledged
    /// queue so it is replayed on the next session
    async fn drain_inbox(&self) -> usize {
        let mut inbox = self.inbox.lock().await;
        let mut drained = 0;
        while let Ok(envelope) = inbox.try_recv() {
            self.unacked.add_forced(envelope);
            drained += 1;
        }
        drained
    }

    async fn health_retrying(&self, component: Component, message: impl Into<String>) {
        if let Some(health) = &self.health {
            health.retrying(component, message).await;
        }
    }
}

/// Decide the session outcome from the first task to finish
fn classify(
    cancel: &CancellationToken,
    first: Option<Result<TaskOutcome, JoinError>>,
) -> RelayResult<SessionEnd> {
    if cancel.is_cancelled() {
        return Ok(SessionEnd::Cancelled);
    }
    match first {
        Some(Ok((TaskRole::Receiver, Ok(())))) => Ok(SessionEnd::PeerClosed),
        Some(Ok((role, Ok(())))) => Err(RelayError::WatchClosed(role.name())),
        Some(Ok((_, Err(e)))) => Err(e),
        Some(Err(e)) => Err(RelayError::TaskFailed(e.to_string())),
        None => Err(RelayError::TaskFailed("no session tasks running".into())),
    }
}

async fn receive_acks(
    mut acks: AckStream,
    unacked: &UnackedQueue,
    metrics: &RelayMetrics,
    watcher: &'static str,
    scope: &CancellationToken,
) -> RelayResult<()> {
    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            next = acks.next() => next,
        };
        match next {
            Some(Ok(ack)) => {
                if unacked.remove(&ack.message_id) {
                    metrics.inc_acked(watcher);
                } else {
                    debug!(watcher, id = %ack.message_id, "Acknowledgement for unknown id");
                }
            }
            Some(Err(status)) => return Err(RelayError::PeerStream(status)),
            None => {
                info!(watcher, "Backend closed the stream");
                return Ok(());
            }
        }
    }
}

/// Sender task state
struct Forwarder {
    inbox: Inbox,
    unacked: Arc<UnackedQueue>,
    outbound: mpsc::Sender<Envelope>,
    progress: Arc<ProgressSink>,
    metrics: RelayMetrics,
    watcher: &'static str,
    progress_min_gap: Duration,
}

impl Forwarder {
    async fn run(self, scope: &CancellationToken) -> RelayResult<()> {
        let mut inbox = tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            guard = Arc::clone(&self.inbox).lock_owned() => guard,
        };

        loop {
            let envelope = tokio::select! {
                biased;
                _ = scope.cancelled() => return Ok(()),
                next = inbox.recv() => match next {
                    Some(envelope) => envelope,
                    None => return Err(RelayError::WatchClosed("send queue")),
                },
            };

            // Recorded before the write so a failed write is replayed later
            if let Err(e) = self.unacked.add(envelope.clone()) {
                self.unacked.add_forced(envelope);
                return Err(e);
            }
            self.metrics.set_unacked(self.watcher, self.unacked.len());

            tokio::select! {
                biased;
                _ = scope.cancelled() => return Ok(()),
                sent = self.outbound.send(envelope) => {
                    if sent.is_err() {
                        return Err(RelayError::Transport("outbound stream closed".into()));
                    }
                }
            }
            self.metrics.inc_sent(self.watcher);

            if let Err(e) = self.progress.touch_if_due(self.progress_min_gap).await {
                warn!(watcher = self.watcher, error = %e, "Failed to write progress file");
            }
        }
    }
}
