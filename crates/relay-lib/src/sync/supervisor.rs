//! Reconnect loop around a streaming session

use super::backoff::ExponentialBackoff;
use super::session::{SessionEnd, StreamingSession};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Reconnection policy between session attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A session that lived at least this long resets the backoff
    pub stable_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            stable_after: Duration::from_secs(60),
        }
    }
}

impl StreamingSession {
    /// Run sessions back to back until `cancel` fires
    ///
    /// Returns the number of sessions that ended for a reason other than
    /// cancellation.
    pub async fn run_forever(&self, policy: &ReconnectPolicy, cancel: &CancellationToken) -> u64 {
        let watcher = self.watcher_name();
        let mut backoff = ExponentialBackoff::new(policy.initial_backoff, policy.max_backoff);
        let mut ended = 0u64;

        loop {
            let started = Instant::now();
            let result = self.run(cancel).await;
            let lifetime = started.elapsed();
            self.metrics().observe_session(watcher, lifetime);

            let outcome = match result {
                Ok(SessionEnd::Cancelled) => break,
                Ok(end) => end.as_str().to_string(),
                Err(e) => e.to_string(),
            };
            self.logger()
                .log_session_end(&outcome, lifetime, self.unacked().len());
            if cancel.is_cancelled() {
                break;
            }

            ended += 1;
            self.metrics().inc_reconnect(watcher);
            if lifetime >= policy.stable_after {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            info!(
                watcher,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.logger().log_shutdown(SessionEnd::Cancelled.as_str());
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_policy_default_caps_at_thirty_seconds() {
        let policy = ReconnectPolicy::default();
        let mut backoff = ExponentialBackoff::new(policy.initial_backoff, policy.max_backoff);
        let last = (0..10).map(|_| backoff.next_delay()).last().unwrap();
        assert_eq!(last, Duration::from_secs(30));
    }
}
