//! Envelope construction with process-unique ids

use crate::proto::{to_timestamp, Envelope, Payload};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wraps payloads into envelopes carrying `<agent>-<boot>-<seq>` ids
#[derive(Debug)]
pub struct EnvelopeFactory {
    prefix: String,
    sequence: AtomicU64,
}

impl EnvelopeFactory {
    pub fn new(agent_id: &str) -> Self {
        let boot = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self {
            prefix: format!("{}-{:x}", agent_id, boot),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn wrap(&self, payload: Payload) -> Envelope {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        Envelope {
            id: format!("{}-{}", self.prefix, seq),
            timestamp: Some(to_timestamp(chrono::Utc::now())),
            payload: Some(payload),
        }
    }
}
