//! Reliable delivery to the relay backend
//!
//! This module provides:
//! - gRPC client with optional mTLS behind the [`RelayTransport`] seam
//! - The unacknowledged queue with ordered replay on reconnect
//! - The bounded watcher → sender queue
//! - Streaming sessions and the reconnect loop around them

mod backoff;
mod client;
mod outbox;
mod session;
mod supervisor;
mod unacked;

#[cfg(test)]
mod tests;

pub use backoff::ExponentialBackoff;
pub use client::{AckStream, ClientConfig, RelayTransport, SyncClient, SyncClientBuilder};
pub use outbox::{Inbox, Outbox};
pub use session::{AgentIdentity, SessionEnd, SessionState, StreamingConfig, StreamingSession};
pub use supervisor::ReconnectPolicy;
pub use unacked::{UnackedEntry, UnackedQueue, DEFAULT_UNACKED_CAPACITY};
