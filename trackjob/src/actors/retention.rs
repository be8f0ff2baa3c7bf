mod actor;
mod messages;

use self::{
    actor::RetentionTracker,
    messages::RetentionMessage::{self, RecordRetrieval, Release, Sweep, Tracked},
};
use crate::error::{self, JobError};
use std::{path::PathBuf, time::Duration};
use tokio::sync::{mpsc, oneshot};

/// Tracks how many files of each result set have been retrieved, and says when a
/// set may be deleted.
///
/// This struct is an actor handle: the counters live in a single task spawned by
/// [`RetentionTrackerHandle::spawn`]. Clone it freely and hand it to whatever serves
/// artifact downloads; there is no global instance.
#[derive(Clone)]
pub struct RetentionTrackerHandle {
    sender: mpsc::Sender<RetentionMessage>,
}

impl RetentionTrackerHandle {
    /// Spawn a new tracker. `message_capacity` bounds the backlog of pending requests.
    pub fn spawn(message_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(message_capacity.max(1));
        RetentionTracker::spawn(receiver);
        Self { sender }
    }

    /// Count one retrieval from `result_set` (a directory of sibling artifacts).
    ///
    /// Different spellings of the same directory (`dir`, `dir/`, `dir/.`, through a
    /// symlink) share one counter.
    ///
    /// The file total is taken from a listing on first use and cached. Returns `true`
    /// exactly once per result set: on the retrieval that accounts for its last file.
    /// The caller is then responsible for deleting the directory.
    pub async fn record_retrieval(&self, result_set: impl Into<PathBuf>) -> error::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RecordRetrieval {
                result_set: result_set.into(),
                response: tx,
            })
            .await
            .map_err(|_| JobError::TrackerStopped)?;
        rx.await.map_err(|_| JobError::TrackerStopped)?
    }

    /// Stop tracking `result_set` without it being fully retrieved.
    pub async fn release(&self, result_set: impl Into<PathBuf>) -> error::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Release {
                result_set: result_set.into(),
                response: tx,
            })
            .await
            .map_err(|_| JobError::TrackerStopped)?;
        rx.await.map_err(|_| JobError::TrackerStopped)
    }

    /// Drop and return every result set first retrieved at least `max_age` ago.
    pub async fn sweep(&self, max_age: Duration) -> error::Result<Vec<PathBuf>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Sweep {
                max_age,
                response: tx,
            })
            .await
            .map_err(|_| JobError::TrackerStopped)?;
        rx.await.map_err(|_| JobError::TrackerStopped)
    }

    pub async fn tracked(&self) -> error::Result<Vec<PathBuf>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Tracked { response: tx })
            .await
            .map_err(|_| JobError::TrackerStopped)?;
        rx.await.map_err(|_| JobError::TrackerStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn result_set(root: &Path, files: usize) -> PathBuf {
        let dir = root.join(format!("set-{}", files));
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..files {
            std::fs::write(dir.join(format!("{}.wav", i)), b"x").unwrap();
        }
        dir
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_deletion_signal_under_concurrency() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = RetentionTrackerHandle::spawn(16);

        for n in [1usize, 2, 10] {
            let dir = result_set(tmp.path(), n);
            let calls = (0..n).map(|_| {
                let tracker = tracker.clone();
                let dir = dir.clone();
                tokio::spawn(async move { tracker.record_retrieval(dir).await.unwrap() })
            });
            let signals = futures::future::join_all(calls)
                .await
                .into_iter()
                .map(|joined| joined.unwrap())
                .filter(|should_delete| *should_delete)
                .count();
            assert_eq!(signals, 1, "result set of {} files", n);
        }
        assert!(tracker.tracked().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn signal_comes_on_last_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = result_set(tmp.path(), 3);
        let tracker = RetentionTrackerHandle::spawn(4);

        assert!(!tracker.record_retrieval(&dir).await.unwrap());
        assert!(!tracker.record_retrieval(&dir).await.unwrap());
        assert_eq!(
            tracker.tracked().await.unwrap(),
            vec![std::fs::canonicalize(&dir).unwrap()]
        );
        assert!(tracker.record_retrieval(&dir).await.unwrap());
        assert!(tracker.tracked().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spellings_of_one_set_share_a_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = result_set(tmp.path(), 2);
        let tracker = RetentionTrackerHandle::spawn(4);

        let trailing = PathBuf::from(format!("{}/", dir.display()));
        assert!(!tracker.record_retrieval(trailing).await.unwrap());
        assert!(tracker.record_retrieval(dir.join(".")).await.unwrap());
        assert!(tracker.tracked().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_or_empty_sets_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = RetentionTrackerHandle::spawn(4);
        let empty = result_set(tmp.path(), 0);
        assert!(matches!(
            tracker.record_retrieval(&empty).await,
            Err(JobError::UnknownResultSet(_))
        ));
        assert!(matches!(
            tracker.record_retrieval(tmp.path().join("gone")).await,
            Err(JobError::UnknownResultSet(_))
        ));
    }

    #[tokio::test]
    async fn release_and_sweep_forget_partial_sets() {
        let tmp = tempfile::tempdir().unwrap();
        let a = result_set(tmp.path(), 2);
        let b = result_set(tmp.path(), 3);
        let tracker = RetentionTrackerHandle::spawn(4);
        tracker.record_retrieval(&a).await.unwrap();
        tracker.record_retrieval(&b).await.unwrap();

        assert!(tracker.release(&a).await.unwrap());
        assert!(!tracker.release(&a).await.unwrap());
        assert!(tracker.sweep(Duration::from_secs(3600)).await.unwrap().is_empty());
        assert_eq!(
            tracker.sweep(Duration::ZERO).await.unwrap(),
            vec![std::fs::canonicalize(&b).unwrap()]
        );
        assert!(tracker.tracked().await.unwrap().is_empty());
    }
}
