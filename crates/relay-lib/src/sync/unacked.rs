//! Reliable delivery queue
//!
//! Every envelope written to the stream is recorded here until the peer
//! acknowledges its id. The queue survives reconnects: a new session replays
//! the remaining entries, oldest first, before any new traffic.

use crate::error::{RelayError, RelayResult};
use crate::proto::Envelope;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Default maximum number of unacknowledged envelopes
pub const DEFAULT_UNACKED_CAPACITY: usize = 10_000;

/// A sent envelope still waiting for its acknowledgement
#[derive(Debug, Clone)]
pub struct UnackedEntry {
    pub envelope: Envelope,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct UnackedInner {
    next_seq: u64,
    /// Enqueue order
    entries: BTreeMap<u64, UnackedEntry>,
    /// Envelope id to enqueue sequence
    index: HashMap<String, u64>,
}

impl UnackedInner {
    fn insert(&mut self, envelope: Envelope) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(envelope.id.clone(), seq);
        self.entries.insert(
            seq,
            UnackedEntry {
                envelope,
                enqueued_at: Instant::now(),
            },
        );
    }
}

/// Bounded record of sent-but-unacknowledged envelopes
#[derive(Debug)]
pub struct UnackedQueue {
    capacity: usize,
    inner: Mutex<UnackedInner>,
}

impl Default for UnackedQueue {
    fn default() -> Self {
        Self::new(DEFAULT_UNACKED_CAPACITY)
    }
}

impl UnackedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(UnackedInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record an envelope, failing when the queue is full
    ///
    /// Adding an id that is already queued keeps its original position.
    pub fn add(&self, envelope: Envelope) -> RelayResult<()> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&envelope.id) {
            return Ok(());
        }
        if inner.entries.len() >= self.capacity {
            return Err(RelayError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        inner.insert(envelope);
        Ok(())
    }

    /// Record an envelope regardless of capacity
    ///
    /// Only used when draining the local send queue on teardown.
    pub fn add_forced(&self, envelope: Envelope) {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&envelope.id) {
            return;
        }
        inner.insert(envelope);
    }

    /// Drop an acknowledged id; unknown ids are ignored
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.remove(id) {
            Some(seq) => {
                inner.entries.remove(&seq);
                true
            }
            None => false,
        }
    }

    /// Replay every queued envelope onto `outbound` in enqueue order
    ///
    /// Entries stay queued until acknowledged. The lock is released before
    /// the first send.
    pub async fn resend_all(&self, outbound: &mpsc::Sender<Envelope>) -> RelayResult<usize> {
        let pending = self.snapshot();
        let count = pending.len();
        for envelope in pending {
            outbound
                .send(envelope)
                .await
                .map_err(|_| RelayError::Transport("outbound stream closed during resend".into()))?;
        }
        if count > 0 {
            debug!(count, "Replayed unacknowledged envelopes");
        }
        Ok(count)
    }

    /// Queued envelopes in enqueue order
    pub fn snapshot(&self) -> Vec<Envelope> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| e.envelope.clone())
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    /// Age of the oldest unacknowledged entry
    pub fn oldest_age(&self) -> Option<Duration> {
        self.inner
            .lock()
            .entries
            .values()
            .next()
            .map(|e| e.enqueued_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{NodeInventory, Payload};

    fn envelope(id: &str) -> Envelope {
        Envelope {
            id: id.to_string(),
            timestamp: None,
            payload: Some(Payload::NodeInventory(NodeInventory::default())),
        }
    }

    #[test]
    fn test_add_then_remove_empties_queue() {
        let queue = UnackedQueue::new(4);
        queue.add(envelope("a")).unwrap();
        assert!(queue.contains("a"));

        assert!(queue.remove("a"));
        assert!(queue.is_empty());
        // Acknowledging twice is harmless
        assert!(!queue.remove("a"));
    }

    #[test]
    fn test_capacity_exceeded() {
        let queue = UnackedQueue::new(2);
        queue.add(envelope("a")).unwrap();
        queue.add(envelope("b")).unwrap();

        let err = queue.add(envelope("c")).unwrap_err();
        assert!(matches!(err, RelayError::CapacityExceeded { capacity: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_add_forced_ignores_capacity() {
        let queue = UnackedQueue::new(1);
        queue.add(envelope("a")).unwrap();
        queue.add_forced(envelope("b"));
        queue.add_forced(envelope("c"));

        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_oldest_age_follows_acknowledgements() {
        let queue = UnackedQueue::new(4);
        assert!(queue.oldest_age().is_none());

        queue.add(envelope("a")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        queue.add(envelope("b")).unwrap();
        assert!(queue.oldest_age().unwrap() >= Duration::from_millis(20));

        queue.remove("a");
        assert!(queue.oldest_age().unwrap() < Duration::from_millis(20));
    }

    #[test]
    fn test_duplicate_add_keeps_position() {
        let queue = UnackedQueue::new(4);
        queue.add(envelope("a")).unwrap();
        queue.add(envelope("b")).unwrap();
        queue.add(envelope("a")).unwrap();

        let ids: Vec<String> = queue.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_resend_all_preserves_order() {
        let queue = UnackedQueue::new(10);
        for id in ["m1", "m2", "m3", "m4"] {
            queue.add(envelope(id)).unwrap();
        }
        queue.remove("m2");

        let (tx, mut rx) = mpsc::channel(10);
        assert_eq!(queue.resend_all(&tx).await.unwrap(), 3);
        drop(tx);

        let mut replayed = Vec::new();
        while let Some(env) = rx.recv().await {
            replayed.push(env.id);
        }
        assert_eq!(replayed, vec!["m1", "m3", "m4"]);
        // Replay does not acknowledge
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_resend_all_fails_on_closed_stream() {
        let queue = UnackedQueue::new(10);
        queue.add(envelope("a")).unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(matches!(
            queue.resend_all(&tx).await,
            Err(RelayError::Transport(_))
        ));
        assert!(queue.contains("a"));
    }
}
