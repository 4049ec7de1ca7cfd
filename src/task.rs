//! Per-URL download tasks for one run.

use std::fmt;

use dashmap::DashMap;
use serde::Serialize;

use crate::download::{DownloadError, Transport};

/// Status of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not attempted yet, or waiting for the next round.
    Pending,
    /// Downloaded and persisted.
    Succeeded,
    /// Last attempt failed.
    Failed,
}

impl TaskStatus {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One URL of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    /// Image URL.
    pub url: String,
    /// Requests issued for this URL across all rounds.
    pub attempt_count: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Current status.
    pub status: TaskStatus,
    /// Transport that served the successful attempt.
    #[serde(skip)]
    pub transport: Option<Transport>,
}

impl DownloadTask {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            attempt_count: 0,
            last_error: None,
            status: TaskStatus::Pending,
            transport: None,
        }
    }
}

/// Concurrent map of tasks keyed by URL.
///
/// Downloads of one wave update disjoint entries, so contention is limited to
/// the shard locks.
#[derive(Debug, Default)]
pub struct TaskLedger {
    tasks: DashMap<String, DownloadTask>,
}

impl TaskLedger {
    /// Creates a ledger with one pending task per URL.
    #[must_use]
    pub fn new<'a>(urls: impl IntoIterator<Item = &'a String>) -> Self {
        let tasks = DashMap::new();
        for url in urls {
            tasks
                .entry(url.clone())
                .or_insert_with(|| DownloadTask::new(url));
        }
        Self { tasks }
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the ledger holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns a copy of the task for `url`.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<DownloadTask> {
        self.tasks.get(url).map(|t| t.clone())
    }

    /// Records a successful download.
    pub fn record_success(&self, url: &str, attempts: u32, transport: Transport) {
        let mut task = self
            .tasks
            .entry(url.to_string())
            .or_insert_with(|| DownloadTask::new(url));
        task.attempt_count = task.attempt_count.saturating_add(attempts);
        task.status = TaskStatus::Succeeded;
        task.last_error = None;
        task.transport = Some(transport);
    }

    /// Records a failed download that issued `attempts` requests.
    pub fn record_failure(&self, url: &str, attempts: u32, error: &DownloadError) {
        let mut task = self
            .tasks
            .entry(url.to_string())
            .or_insert_with(|| DownloadTask::new(url));
        task.attempt_count = task.attempt_count.saturating_add(attempts);
        task.status = TaskStatus::Failed;
        task.last_error = Some(error.to_string());
    }

    /// Number of succeeded tasks.
    #[must_use]
    pub fn succeeded_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .count()
    }

    /// All tasks, sorted by URL.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by(|a, b| a.url.cmp(&b.url));
        tasks
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn urls() -> Vec<String> {
        vec![
            "https://a.example/1.jpg".to_string(),
            "https://a.example/2.jpg".to_string(),
            "https://a.example/1.jpg".to_string(),
        ]
    }

    #[test]
    fn test_new_ledger_dedupes_and_starts_pending() {
        let ledger = TaskLedger::new(&urls());
        assert_eq!(ledger.len(), 2);
        let task = ledger.get("https://a.example/1.jpg").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
    }

    #[test]
    fn test_failure_then_success_accumulates_attempts() {
        let ledger = TaskLedger::new(&urls());
        let url = "https://a.example/2.jpg";
        ledger.record_failure(url, 2, &DownloadError::timeout(url));
        let failed = ledger.get(url).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.last_error.unwrap().contains("timeout"));

        ledger.record_success(url, 2, Transport::Lightweight);
        let task = ledger.get(url).unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempt_count, 4);
        assert_eq!(task.last_error, None);
        assert_eq!(task.transport, Some(Transport::Lightweight));
        assert_eq!(ledger.succeeded_count(), 1);
    }

    #[test]
    fn test_snapshot_sorted_by_url() {
        let ledger = TaskLedger::new(&urls());
        let urls: Vec<_> = ledger.snapshot().into_iter().map(|t| t.url).collect();
        assert_eq!(urls, vec!["https://a.example/1.jpg", "https://a.example/2.jpg"]);
    }
}
