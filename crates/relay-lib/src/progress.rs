//! Progress/liveness sink
//!
//! Records the last time the relay made observable progress and mirrors it
//! into a side file for an external liveness probe. The file holds a single
//! RFC 3339 timestamp and is replaced atomically.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

#[derive(Debug)]
struct ProgressState {
    last_progress: Option<(Instant, DateTime<Utc>)>,
    last_written: Option<Instant>,
}

#[derive(Debug)]
pub struct ProgressSink {
    path: Option<PathBuf>,
    created: Instant,
    state: Mutex<ProgressState>,
    // The heartbeat and the sender share one temp file
    write_lock: tokio::sync::Mutex<()>,
}

impl ProgressSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            created: Instant::now(),
            state: Mutex::new(ProgressState {
                last_progress: None,
                last_written: None,
            }),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Sink that only keeps progress in memory
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record progress now and write the side file unconditionally
    pub async fn record(&self) -> Result<()> {
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            state.last_progress = Some((Instant::now(), now));
            state.last_written = Some(Instant::now());
        }
        self.write_file(now).await
    }

    /// Record progress, writing the side file only if the last write is
    /// older than `min_gap`. Returns whether the file was written.
    pub async fn touch_if_due(&self, min_gap: Duration) -> Result<bool> {
        let now = Utc::now();
        let due = {
            let mut state = self.state.lock();
            let instant = Instant::now();
            state.last_progress = Some((instant, now));
            let due = state
                .last_written
                .map_or(true, |written| instant.saturating_duration_since(written) >= min_gap);
            if due {
                state.last_written = Some(instant);
            }
            due
        };
        if due {
            self.write_file(now).await?;
        }
        Ok(due)
    }

    pub fn last_progress(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_progress.map(|(_, at)| at)
    }

    /// Time since the last recorded progress, or since creation if none
    pub fn idle_for(&self) -> Duration {
        let since = self
            .state
            .lock()
            .last_progress
            .map_or(self.created, |(instant, _)| instant);
        since.elapsed()
    }

    pub fn is_stale(&self, bound: Duration) -> bool {
        self.idle_for() > bound
    }

    async fn write_file(&self, at: DateTime<Utc>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        file.write_all(at.to_rfc3339().as_bytes())
            .await
            .context("Failed to write progress timestamp")?;
        file.sync_all().await.context("Failed to sync progress file")?;
        drop(file);

        tokio::fs::rename(&temp_path, path)
            .await
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_record_writes_rfc3339_timestamp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("progress");
        let sink = ProgressSink::new(Some(path.clone()));

        sink.record().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed = DateTime::parse_from_rfc3339(&content).unwrap();
        assert_eq!(parsed.with_timezone(&Utc), sink.last_progress().unwrap());
    }

    #[tokio::test]
    async fn test_touch_if_due_rate_limits_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress");
        let sink = ProgressSink::new(Some(path.clone()));

        assert!(sink.touch_if_due(Duration::from_secs(60)).await.unwrap());
        assert!(!sink.touch_if_due(Duration::from_secs(60)).await.unwrap());
        assert!(sink.touch_if_due(Duration::ZERO).await.unwrap());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_in_memory_sink_tracks_staleness() {
        let sink = ProgressSink::in_memory();
        assert!(sink.last_progress().is_none());
        assert!(!sink.is_stale(Duration::from_secs(60)));

        sink.record().await.unwrap();
        assert!(sink.last_progress().is_some());
        assert!(sink.idle_for() < Duration::from_secs(60));
        assert!(!sink.is_stale(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_a_valid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress");
        let sink = std::sync::Arc::new(ProgressSink::new(Some(path.clone())));

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let sink = std::sync::Arc::clone(&sink);
                tokio::spawn(async move { sink.record().await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(DateTime::parse_from_rfc3339(&content).is_ok());
        assert!(!path.with_extension("tmp").exists());
    }
}
