use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Progress notifications per job are capped at 10/second.
const NOTIFY_INTERVAL: Duration = Duration::from_millis(100);

/// One live file transfer within a job.
#[derive(Debug)]
pub(crate) struct Subtask {
    pub url: String,
    pub temp_path: PathBuf,
    pub final_path: PathBuf,
    /// Exact byte size when the catalog pins one (single-file variants).
    pub declared_size: Option<u64>,
    /// Exact-match validation vs. the heuristic floor.
    pub exact_size: bool,
    pub sha256: Option<String>,
    pub bytes_received: u64,
    pub expected_bytes: Option<u64>,
    pub cancel: CancellationToken,
    /// Set by a discarding cancel: the transfer worker removes its temp file
    /// instead of leaving resume data behind.
    pub discard_on_cancel: Arc<AtomicBool>,
}

/// State for one in-flight model acquisition.
///
/// Owned exclusively by the orchestrator; transfer workers never touch it
/// directly, they report through the dispatcher channel.
#[derive(Debug)]
pub struct DownloadJob {
    subtasks: HashMap<u64, Subtask>,
    /// Bytes of files already finished, validated, and moved into place.
    committed_bytes: u64,
    completed: u64,
    total: u64,
    last_notify: Option<Instant>,
}

impl DownloadJob {
    pub(crate) fn new() -> Self {
        Self {
            subtasks: HashMap::new(),
            committed_bytes: 0,
            completed: 0,
            total: 0,
            last_notify: None,
        }
    }

    pub(crate) fn insert_subtask(&mut self, transfer_id: u64, subtask: Subtask) {
        self.subtasks.insert(transfer_id, subtask);
        self.recompute();
    }

    /// Update a subtask from a transfer callback.
    pub(crate) fn record_written(
        &mut self,
        transfer_id: u64,
        bytes_received: u64,
        expected_bytes: Option<u64>,
    ) {
        if let Some(sub) = self.subtasks.get_mut(&transfer_id) {
            sub.bytes_received = bytes_received;
            if expected_bytes.is_some() {
                sub.expected_bytes = expected_bytes;
            }
        }
        self.recompute();
    }

    pub(crate) fn record_expected(&mut self, transfer_id: u64, expected_bytes: Option<u64>) {
        if let Some(sub) = self.subtasks.get_mut(&transfer_id) {
            if expected_bytes.is_some() {
                sub.expected_bytes = expected_bytes;
            }
        }
        self.recompute();
    }

    /// Detach a finished subtask for finalization.
    pub(crate) fn take_subtask(&mut self, transfer_id: u64) -> Option<Subtask> {
        self.subtasks.remove(&transfer_id)
    }

    /// Fold a finished file's bytes into the committed counter.
    pub(crate) fn commit_bytes(&mut self, bytes: u64) {
        self.committed_bytes += bytes;
        self.recompute();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    /// (completed, total) byte counts. `total >= completed` always;
    /// `completed` never decreases across any callback interleaving.
    #[must_use]
    pub fn progress(&self) -> (u64, u64) {
        (self.completed, self.total)
    }

    /// Cancel every live subtask. With `discard`, temp files are removed
    /// both here and by each worker on its way out, so no partial survives
    /// regardless of which side wins the race.
    pub(crate) fn cancel_all(&mut self, discard: bool) {
        for sub in self.subtasks.values() {
            if discard {
                sub.discard_on_cancel.store(true, Ordering::SeqCst);
                let _ = std::fs::remove_file(&sub.temp_path);
            }
            sub.cancel.cancel();
        }
        self.subtasks.clear();
    }

    /// Throttle check for progress notifications. The completion
    /// notification passes `force` and is never dropped.
    pub(crate) fn should_notify(&mut self, force: bool) -> bool {
        let now = Instant::now();
        if force
            || self
                .last_notify
                .is_none_or(|last| now.duration_since(last) >= NOTIFY_INTERVAL)
        {
            self.last_notify = Some(now);
            return true;
        }
        false
    }

    fn recompute(&mut self) {
        let received: u64 = self.subtasks.values().map(|s| s.bytes_received).sum();
        let expected: u64 = self
            .subtasks
            .values()
            .map(|s| s.expected_bytes.unwrap_or(s.bytes_received))
            .sum();

        // Committed bytes only ever grow and a subtask's received count is
        // folded into committed before removal, so this is monotone; the max
        // guards the invariant anyway.
        self.completed = self.completed.max(self.committed_bytes + received);
        self.total = self
            .total
            .max(self.committed_bytes + expected)
            .max(self.completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask(declared: Option<u64>) -> Subtask {
        Subtask {
            url: "https://host/file.gguf".to_string(),
            temp_path: PathBuf::from("/tmp/file.gguf.part"),
            final_path: PathBuf::from("/tmp/file.gguf"),
            declared_size: declared,
            exact_size: declared.is_some(),
            sha256: None,
            bytes_received: 0,
            expected_bytes: declared,
            cancel: CancellationToken::new(),
            discard_on_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn test_progress_aggregates_live_subtasks() {
        let mut job = DownloadJob::new();
        job.insert_subtask(1, subtask(Some(1000)));
        job.insert_subtask(2, subtask(Some(500)));

        job.record_written(1, 100, Some(1000));
        job.record_written(2, 50, Some(500));

        assert_eq!(job.progress(), (150, 1500));
    }

    #[test]
    fn test_completed_is_monotone_across_interleavings() {
        let mut job = DownloadJob::new();
        job.insert_subtask(1, subtask(Some(1000)));
        job.insert_subtask(2, subtask(Some(500)));

        let mut last = 0;
        for (id, bytes) in [(1, 200), (2, 100), (1, 600), (2, 400), (1, 1000)] {
            job.record_written(id, bytes, None);
            let (completed, total) = job.progress();
            assert!(completed >= last, "completed regressed: {completed} < {last}");
            assert!(total >= completed);
            last = completed;
        }
    }

    #[test]
    fn test_finish_jumps_by_exactly_the_file_size() {
        // Two-file job: main finishes first while the shard is mid-flight.
        let mut job = DownloadJob::new();
        job.insert_subtask(1, subtask(Some(1000)));
        job.insert_subtask(2, subtask(Some(500)));
        job.record_written(1, 1000, Some(1000));
        job.record_written(2, 200, Some(500));
        assert_eq!(job.progress(), (1200, 1500));

        let sub = job.take_subtask(1).unwrap();
        assert_eq!(sub.bytes_received, 1000);
        job.commit_bytes(1000);

        // Same completed figure, no reset, shard still counted.
        assert_eq!(job.progress(), (1200, 1500));
        job.record_written(2, 500, Some(500));
        assert_eq!(job.progress(), (1500, 1500));
    }

    #[test]
    fn test_total_never_shrinks_when_expectation_drops() {
        let mut job = DownloadJob::new();
        job.insert_subtask(1, subtask(Some(1000)));
        assert_eq!(job.progress().1, 1000);

        // A re-issued request with a smaller content-length must not lower
        // the reported total.
        job.record_written(1, 10, Some(800));
        assert_eq!(job.progress().1, 1000);
    }

    #[test]
    fn test_unknown_expectation_falls_back_to_received() {
        let mut job = DownloadJob::new();
        let mut sub = subtask(None);
        sub.expected_bytes = None;
        job.insert_subtask(1, sub);

        job.record_written(1, 300, None);
        assert_eq!(job.progress(), (300, 300));
    }

    #[test]
    fn test_throttle_allows_forced_final_notification() {
        let mut job = DownloadJob::new();
        assert!(job.should_notify(false));
        assert!(!job.should_notify(false));
        assert!(job.should_notify(true));
    }

    #[test]
    fn test_cancel_all_empties_subtasks() {
        let mut job = DownloadJob::new();
        job.insert_subtask(1, subtask(None));
        job.insert_subtask(2, subtask(None));
        job.cancel_all(false);
        assert!(job.is_empty());
    }
}
