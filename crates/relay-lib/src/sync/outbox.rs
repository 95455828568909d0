//! Bounded queue between a watcher and its sender task
//!
//! The queue outlives individual sessions so that anything still buffered
//! when a session ends can be moved into the unacknowledged queue.

use crate::envelope::EnvelopeFactory;
use crate::error::{RelayError, RelayResult};
use crate::observability::RelayMetrics;
use crate::proto::{Envelope, Payload};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Receiving half, shared between successive sessions
pub type Inbox = Arc<Mutex<mpsc::Receiver<Envelope>>>;

/// Producer handle given to a watcher
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Envelope>,
    factory: Arc<EnvelopeFactory>,
    watcher: &'static str,
    metrics: RelayMetrics,
}

impl Outbox {
    /// Create a queue holding at most `capacity` envelopes
    pub fn channel(
        capacity: usize,
        factory: Arc<EnvelopeFactory>,
        watcher: &'static str,
        metrics: RelayMetrics,
    ) -> (Outbox, Inbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbox = Outbox {
            tx,
            factory,
            watcher,
            metrics,
        };
        (outbox, Arc::new(Mutex::new(rx)))
    }

    pub fn watcher(&self) -> &'static str {
        self.watcher
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Wrap `payload` and enqueue it, waiting while the queue is full
    ///
    /// Returns `Cancelled` if `cancel` fires first; the payload is then
    /// not enqueued.
    pub async fn send(&self, payload: Payload, cancel: &CancellationToken) -> RelayResult<()> {
        let kind = payload.kind();
        let envelope = self.factory.wrap(payload);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            sent = self.tx.send(envelope) => {
                sent.map_err(|_| RelayError::WatchClosed("send queue"))?;
                self.metrics.inc_enqueued(self.watcher, kind);
                Ok(())
            }
        }
    }

    /// Free slots left in the queue
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::NodeInventory;
    use std::time::Duration;

    fn inventory(host: &str) -> Payload {
        Payload::NodeInventory(NodeInventory {
            hostnames: vec![host.to_string()],
        })
    }

    #[tokio::test]
    async fn test_send_preserves_fifo_order() {
        let factory = Arc::new(EnvelopeFactory::new("agent"));
        let (outbox, inbox) = Outbox::channel(8, factory, "node", RelayMetrics::new());
        let cancel = CancellationToken::new();

        for host in ["a", "b", "c"] {
            outbox.send(inventory(host), &cancel).await.unwrap();
        }

        let mut rx = inbox.lock().await;
        for host in ["a", "b", "c"] {
            let envelope = rx.recv().await.unwrap();
            match envelope.payload {
                Some(Payload::NodeInventory(inv)) => assert_eq!(inv.hostnames, vec![host]),
                other => panic!("unexpected payload {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure_until_cancelled() {
        let factory = Arc::new(EnvelopeFactory::new("agent"));
        let (outbox, _inbox) = Outbox::channel(1, factory, "node", RelayMetrics::new());
        let cancel = CancellationToken::new();

        outbox.send(inventory("a"), &cancel).await.unwrap();
        assert_eq!(outbox.available(), 0);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            outbox.send(inventory("b"), &cancel),
        )
        .await;
        assert!(blocked.is_err());

        cancel.cancel();
        assert!(matches!(
            outbox.send(inventory("b"), &cancel).await,
            Err(RelayError::Cancelled)
        ));
    }
}
