//! Serving published result sets one file at a time.
//!
//! A result set is a directory `<retrieval_root>/<job_id>/` holding one file per
//! artifact. It lives until every file in it has been retrieved once, then the
//! [`ArtifactServer`] deletes it.

use crate::actors::retention::RetentionTrackerHandle;
use crate::error::{JobError, Result};
use crate::types::JobId;
use crate::workspace::WorkspaceManager;
use bytes::Bytes;
use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::fs;

/// Copy `files` into a fresh result set for `job_id` and return its directory.
///
/// Each entry is `(file name, source path)`. An existing result set for the same
/// job is replaced.
pub async fn publish(
    retrieval_root: &Path,
    job_id: JobId,
    files: &[(String, PathBuf)],
) -> Result<PathBuf> {
    let dir = retrieval_root.join(job_id.to_string());
    let to_err = |source| JobError::Workspace {
        path: dir.clone(),
        source,
    };
    match fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(to_err(err)),
    }
    fs::create_dir_all(&dir).await.map_err(to_err)?;
    for (name, source) in files {
        fs::copy(source, dir.join(name)).await.map_err(to_err)?;
    }
    tracing::info!(job_id = %job_id, result_set = ?dir, files = files.len(), "result set published");
    Ok(dir)
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Hands out result-set files and deletes each set once it has been fully retrieved.
#[derive(Clone)]
pub struct ArtifactServer {
    tracker: RetentionTrackerHandle,
    workspaces: Arc<dyn WorkspaceManager>,
}

impl ArtifactServer {
    pub fn new(tracker: RetentionTrackerHandle, workspaces: Arc<dyn WorkspaceManager>) -> Self {
        Self {
            tracker,
            workspaces,
        }
    }

    /// Read `file_name` from `result_set` and count the retrieval.
    pub async fn retrieve(&self, result_set: &Path, file_name: &str) -> Result<Bytes> {
        if !is_plain_file_name(file_name) {
            return Err(JobError::InvalidRequest(format!(
                "{:?} is not a plain file name",
                file_name
            )));
        }
        let path = result_set.join(file_name);
        let body = match fs::read(&path).await {
            Ok(body) => Bytes::from(body),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(JobError::UnknownResultSet(path))
            }
            Err(source) => return Err(JobError::Workspace { path, source }),
        };

        if self.tracker.record_retrieval(result_set).await? {
            if let Err(err) = self.workspaces.destroy(result_set).await {
                tracing::error!(result_set = ?result_set, error = %err, "failed to delete retrieved result set");
            }
        }
        Ok(body)
    }

    /// Delete a result set regardless of how much of it was retrieved.
    pub async fn discard(&self, result_set: &Path) -> Result<()> {
        self.tracker.release(result_set).await?;
        self.workspaces.destroy(result_set).await
    }

    /// Delete result sets whose retrieval started at least `max_age` ago and never finished.
    pub async fn expire(&self, max_age: Duration) -> Result<Vec<PathBuf>> {
        let stale = self.tracker.sweep(max_age).await?;
        for dir in &stale {
            if let Err(err) = self.workspaces.destroy(dir).await {
                tracing::error!(result_set = ?dir, error = %err, "failed to delete expired result set");
            }
        }
        Ok(stale)
    }
}
