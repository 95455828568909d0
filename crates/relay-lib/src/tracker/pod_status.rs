//! Workflow pod status tracker keyed by (workflow, task, retry)

use super::{TrackerConfig, TtlTracker};
use crate::models::PodStatusRecord;
use std::time::Instant;

/// Composite identity of one attempt of a workflow task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub workflow_id: String,
    pub task_id: String,
    pub retry_id: String,
}

impl TaskKey {
    pub fn new(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        retry_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            retry_id: retry_id.into(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.workflow_id, self.task_id, self.retry_id)
    }
}

#[derive(Debug)]
pub struct PodStatusTracker {
    inner: TtlTracker<TaskKey, PodStatusRecord>,
}

impl PodStatusTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            inner: TtlTracker::new(config.ttl),
        }
    }

    pub fn should_report_at(&self, key: &TaskKey, status: &PodStatusRecord, now: Instant) -> bool {
        self.inner.should_report_at(key, status, now)
    }

    pub fn should_report(&self, key: &TaskKey, status: &PodStatusRecord) -> bool {
        self.should_report_at(key, status, Instant::now())
    }

    pub fn last_reported(&self, key: &TaskKey) -> Option<PodStatusRecord> {
        self.inner.get(key)
    }

    pub fn remove(&self, key: &TaskKey) -> Option<PodStatusRecord> {
        self.inner.remove(key)
    }

    /// Every tracked key with its last reported status
    pub fn entries(&self) -> Vec<(TaskKey, PodStatusRecord)> {
        self.inner
            .keys()
            .into_iter()
            .filter_map(|k| self.inner.get(&k).map(|v| (k, v)))
            .collect()
    }

    /// Keep only keys accepted by `keep`
    pub fn retain(&self, keep: impl FnMut(&TaskKey) -> bool) {
        self.inner.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::TaskStatus;
    use std::time::Duration;

    #[test]
    fn test_status_transitions_are_reported() {
        let tracker = PodStatusTracker::new(&TrackerConfig::default());
        let key = TaskKey::new("wf-1", "task-a", "0");
        let now = Instant::now();

        let running = PodStatusRecord::new(TaskStatus::Running, 0, "");
        let failed = PodStatusRecord::new(TaskStatus::Failed, 137, "OOMKilled");

        assert!(tracker.should_report_at(&key, &running, now));
        assert!(!tracker.should_report_at(&key, &running, now + Duration::from_secs(5)));
        assert!(tracker.should_report_at(&key, &failed, now + Duration::from_secs(6)));
        assert_eq!(tracker.last_reported(&key), Some(failed));
    }

    #[test]
    fn test_retries_are_distinct_keys() {
        let tracker = PodStatusTracker::new(&TrackerConfig::default());
        let running = PodStatusRecord::new(TaskStatus::Running, 0, "");

        assert!(tracker.should_report(&TaskKey::new("wf-1", "task-a", "0"), &running));
        assert!(tracker.should_report(&TaskKey::new("wf-1", "task-a", "1"), &running));
        assert_eq!(tracker.len(), 2);
        assert_eq!(TaskKey::new("wf-1", "task-a", "1").to_string(), "wf-1/task-a/1");
    }
}
