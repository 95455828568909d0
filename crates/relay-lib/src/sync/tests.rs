//! Session tests against an in-process peer
//!
//! These tests verify:
//! - Acknowledgement handling and the unacknowledged queue
//! - Replay order across reconnects
//! - Session teardown on peer close, stream errors and capacity exhaustion
//! - The reconnect loop

use super::*;
use crate::error::{RelayError, RelayResult};
use crate::health::{ComponentStatus, HealthRegistry};
use crate::progress::ProgressSink;
use crate::proto::{Envelope, InitBackendRequest, InitBackendResponse, NodeInventory, Payload, StreamAck};
use crate::watchers::DomainWatcher;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

/// Backend side of one open stream
struct Peer {
    envelopes: mpsc::Receiver<Envelope>,
    acks: mpsc::UnboundedSender<Result<StreamAck, tonic::Status>>,
}

impl Peer {
    async fn next_id(&mut self) -> String {
        tokio::time::timeout(WAIT, self.envelopes.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("outbound stream closed")
            .id
    }

    async fn next_host(&mut self) -> (String, String) {
        let envelope = tokio::time::timeout(WAIT, self.envelopes.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("outbound stream closed");
        let host = match envelope.payload {
            Some(Payload::NodeInventory(inv)) => inv.hostnames[0].clone(),
            other => panic!("unexpected payload {:?}", other),
        };
        (envelope.id, host)
    }

    fn ack(&self, id: &str) {
        let _ = self.acks.send(Ok(StreamAck {
            message_id: id.to_string(),
        }));
    }

    fn fail(&self, status: tonic::Status) {
        let _ = self.acks.send(Err(status));
    }
}

struct FakeTransport {
    responses: Mutex<VecDeque<RelayResult<InitBackendResponse>>>,
    registrations: AtomicUsize,
    peers: mpsc::UnboundedSender<Peer>,
}

impl FakeTransport {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            registrations: AtomicUsize::new(0),
            peers,
        });
        (transport, rx)
    }

    fn script(&self, response: RelayResult<InitBackendResponse>) {
        self.responses.lock().push_back(response);
    }

    fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayTransport for FakeTransport {
    async fn init_backend(&self, request: InitBackendRequest) -> RelayResult<InitBackendResponse> {
        assert_eq!(request.agent_id, "agent-test");
        assert_eq!(request.watcher, "scripted");
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.responses.lock().pop_front().unwrap_or(Ok(InitBackendResponse {
            accepted: true,
            message: String::new(),
        }))
    }

    async fn open_stream(&self, outbound: mpsc::Receiver<Envelope>) -> RelayResult<AckStream> {
        let (acks, ack_rx) = mpsc::unbounded_channel();
        self.peers
            .send(Peer {
                envelopes: outbound,
                acks,
            })
            .map_err(|_| RelayError::Transport("test peer gone".into()))?;
        Ok(Box::pin(UnboundedReceiverStream::new(ack_rx)))
    }
}

/// Watcher that enqueues whatever the test feeds it
struct ScriptedWatcher {
    feed: tokio::sync::Mutex<mpsc::UnboundedReceiver<Payload>>,
}

impl ScriptedWatcher {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(Self {
            feed: tokio::sync::Mutex::new(rx),
        });
        (watcher, tx)
    }
}

#[async_trait]
impl DomainWatcher for ScriptedWatcher {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, outbox: Outbox, cancel: CancellationToken) -> RelayResult<()> {
        let mut feed = self.feed.lock().await;
        loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = feed.recv() => next,
            };
            let Some(payload) = payload else {
                cancel.cancelled().await;
                return Ok(());
            };
            match outbox.send(payload, &cancel).await {
                Ok(()) => {}
                Err(RelayError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

fn host(name: &str) -> Payload {
    Payload::NodeInventory(NodeInventory {
        hostnames: vec![name.to_string()],
    })
}

fn test_config() -> StreamingConfig {
    StreamingConfig {
        heartbeat_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(500),
        register_initial_backoff: Duration::from_millis(10),
        register_max_backoff: Duration::from_millis(20),
        ..Default::default()
    }
}

struct Setup {
    session: Arc<StreamingSession>,
    transport: Arc<FakeTransport>,
    peers: mpsc::UnboundedReceiver<Peer>,
    feed: mpsc::UnboundedSender<Payload>,
    progress: Arc<ProgressSink>,
}

fn setup(config: StreamingConfig) -> Setup {
    let (transport, peers) = FakeTransport::new();
    let (watcher, feed) = ScriptedWatcher::new();
    let progress = Arc::new(ProgressSink::in_memory());
    let identity = AgentIdentity {
        agent_id: "agent-test".to_string(),
        agent_version: "0.1.0".to_string(),
        cluster_uid: "cluster-uid".to_string(),
    };
    let session = StreamingSession::new(
        transport.clone(),
        watcher,
        identity,
        config,
        Arc::clone(&progress),
    );
    Setup {
        session: Arc::new(session),
        transport,
        peers,
        feed,
        progress,
    }
}

fn attach_health(session: Arc<StreamingSession>, health: &HealthRegistry) -> Arc<StreamingSession> {
    let session = Arc::try_unwrap(session).ok().expect("session already shared");
    Arc::new(session.with_health(health.clone()))
}

fn spawn_run(
    session: &Arc<StreamingSession>,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<RelayResult<SessionEnd>> {
    let session = Arc::clone(session);
    let cancel = cancel.clone();
    tokio::spawn(async move { session.run(&cancel).await })
}

async fn next_peer(peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    tokio::time::timeout(WAIT, peers.recv())
        .await
        .expect("timed out waiting for stream")
        .expect("transport dropped")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn finished(
    handle: tokio::task::JoinHandle<RelayResult<SessionEnd>>,
) -> RelayResult<SessionEnd> {
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("session did not end")
        .expect("session panicked")
}

mod streaming_tests {
    use super::*;

    #[tokio::test]
    async fn test_acks_remove_envelopes_from_unacked() {
        let mut s = setup(test_config());
        let cancel = CancellationToken::new();
        let handle = spawn_run(&s.session, &cancel);

        let mut peer = next_peer(&mut s.peers).await;
        s.feed.send(host("a")).unwrap();
        s.feed.send(host("b")).unwrap();

        let (first, a) = peer.next_host().await;
        let (second, b) = peer.next_host().await;
        assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
        assert_eq!(s.session.unacked().len(), 2);
        assert!(s.progress.last_progress().is_some());

        peer.ack(&first);
        let unacked = Arc::clone(s.session.unacked());
        eventually(|| unacked.len() == 1).await;
        assert!(unacked.contains(&second));

        cancel.cancel();
        let end = assert_ok!(finished(handle).await);
        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(s.session.state(), SessionState::Disconnected);
        assert_eq!(s.transport.registrations(), 1);
    }

    #[tokio::test]
    async fn test_peer_close_ends_session_cleanly() {
        let mut s = setup(test_config());
        let cancel = CancellationToken::new();
        let handle = spawn_run(&s.session, &cancel);

        let peer = next_peer(&mut s.peers).await;
        drop(peer);

        assert_eq!(finished(handle).await.unwrap(), SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_stream_error_replays_unacked_in_order() {
        let mut s = setup(test_config());
        let cancel = CancellationToken::new();
        let handle = spawn_run(&s.session, &cancel);

        let mut peer = next_peer(&mut s.peers).await;
        for name in ["a", "b", "c"] {
            s.feed.send(host(name)).unwrap();
        }
        let (id_a, _) = peer.next_host().await;
        let (id_b, _) = peer.next_host().await;
        let (id_c, _) = peer.next_host().await;
        peer.ack(&id_a);
        peer.fail(tonic::Status::unavailable("backend restarting"));

        let err = assert_err!(finished(handle).await);
        assert!(matches!(err, RelayError::PeerStream(_)));
        let pending: Vec<String> = s.session.unacked().snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(pending, vec![id_b.clone(), id_c.clone()]);

        // Next session replays before anything new
        let handle = spawn_run(&s.session, &cancel);
        let mut peer = next_peer(&mut s.peers).await;
        s.feed.send(host("d")).unwrap();
        assert_eq!(peer.next_id().await, id_b);
        assert_eq!(peer.next_id().await, id_c);
        let (_, d) = peer.next_host().await;
        assert_eq!(d, "d");

        cancel.cancel();
        assert_eq!(finished(handle).await.unwrap(), SessionEnd::Cancelled);
        assert_eq!(s.transport.registrations(), 2);
    }

    #[tokio::test]
    async fn test_registration_retried_until_accepted() {
        let mut s = setup(test_config());
        s.transport.script(Ok(InitBackendResponse {
            accepted: false,
            message: "cluster not enrolled".to_string(),
        }));
        s.transport
            .script(Err(RelayError::Transport("connection refused".into())));

        let health = HealthRegistry::new();
        let session = attach_health(s.session, &health);
        let cancel = CancellationToken::new();
        let handle = spawn_run(&session, &cancel);

        let _peer = next_peer(&mut s.peers).await;
        assert_eq!(s.transport.registrations(), 3);
        let deadline = tokio::time::Instant::now() + WAIT;
        while !health.readiness().await.ready {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        assert_eq!(finished(handle).await.unwrap(), SessionEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_registration() {
        let s = setup(test_config());
        for _ in 0..100 {
            s.transport
                .script(Err(RelayError::Transport("connection refused".into())));
        }
        let cancel = CancellationToken::new();
        let handle = spawn_run(&s.session, &cancel);

        let transport = Arc::clone(&s.transport);
        eventually(|| transport.registrations() >= 2).await;
        cancel.cancel();
        assert_eq!(finished(handle).await.unwrap(), SessionEnd::Cancelled);
    }
}

mod capacity_tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_exceeded_ends_session_without_loss() {
        let mut s = setup(StreamingConfig {
            unacked_capacity: 2,
            ..test_config()
        });
        let health = HealthRegistry::new();
        s.session = attach_health(s.session, &health);
        let cancel = CancellationToken::new();
        let handle = spawn_run(&s.session, &cancel);

        let mut peer = next_peer(&mut s.peers).await;
        for name in ["a", "b", "c"] {
            s.feed.send(host(name)).unwrap();
        }

        let err = assert_err!(finished(handle).await);
        assert!(matches!(err, RelayError::CapacityExceeded { capacity: 2 }));
        // The envelope that did not fit is kept for replay
        assert_eq!(s.session.unacked().len(), 3);
        let (_, a) = peer.next_host().await;
        let (_, b) = peer.next_host().await;
        assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
        let report = health.report().await;
        assert_eq!(report.components["stream"].status, ComponentStatus::Unhealthy);
        assert!(!health.readiness().await.ready);

        let handle = spawn_run(&s.session, &cancel);
        let mut peer = next_peer(&mut s.peers).await;
        let replayed: Vec<String> = [
            peer.next_host().await.1,
            peer.next_host().await.1,
            peer.next_host().await.1,
        ]
        .to_vec();
        assert_eq!(replayed, vec!["a", "b", "c"]);
        assert!(health.readiness().await.ready);

        cancel.cancel();
        assert_eq!(finished(handle).await.unwrap(), SessionEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_drains_send_queue_into_unacked() {
        let mut s = setup(StreamingConfig {
            outbound_buffer: 1,
            ..test_config()
        });
        let cancel = CancellationToken::new();
        let handle = spawn_run(&s.session, &cancel);

        // The peer never reads, so the sender stalls on the second envelope
        let _peer = next_peer(&mut s.peers).await;
        for name in ["a", "b", "c", "d"] {
            s.feed.send(host(name)).unwrap();
        }
        let unacked = Arc::clone(s.session.unacked());
        eventually(|| unacked.len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        assert_eq!(finished(handle).await.unwrap(), SessionEnd::Cancelled);
        assert_eq!(unacked.len(), 4);
    }
}

mod reconnect_tests {
    use super::*;

    #[tokio::test]
    async fn test_run_forever_reconnects_until_cancelled() {
        let mut s = setup(test_config());
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            stable_after: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();

        let session = Arc::clone(&s.session);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { session.run_forever(&policy, &loop_cancel).await });

        let first = next_peer(&mut s.peers).await;
        drop(first);
        let _second = next_peer(&mut s.peers).await;

        cancel.cancel();
        let ended = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(ended, 1);
        assert_eq!(s.transport.registrations(), 2);
    }
}
