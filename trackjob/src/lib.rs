//! Runs media jobs (stem separation, track analysis, mp3 conversion) through external
//! tools in disposable workspaces, stores the artifacts they produce, and tracks the
//! job records along the way.

mod actors;
pub mod blob;
pub mod command;
pub mod config;
pub mod error;
mod events;
pub mod executor;
pub mod harvest;
pub mod job;
pub mod orchestrator;
pub mod repository;
pub mod retrieval;
pub mod types;
pub mod workspace;

// re-export the tracker handle as if it is the tracker itself.
pub use actors::retention::RetentionTrackerHandle as RetentionTracker;
pub use blob::{BlobStore, LocalBlobStore};
pub use config::{OrchestratorConfig, ToolConfig, UnrecognizedRolePolicy};
pub use error::{JobError, Result};
pub use events::{JobStatus, ProcessStatus};
pub use job::{Job, JobKind, JobParameters, JobResult, TrackAnalysis};
pub use orchestrator::Orchestrator;
pub use repository::{InMemoryJobRepository, JobRepository, JsonFileJobRepository};
pub use retrieval::ArtifactServer;
pub use workspace::{LocalWorkspaceManager, WorkspaceManager};

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::{
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        sync::Arc,
    };
    use uuid::Uuid;

    /// Encoder stand-in: copies the input (third arg) to the output (last arg).
    fn fake_encoder(dir: &Path) -> PathBuf {
        let encoder = dir.join("fake-ffmpeg");
        std::fs::write(&encoder, "#!/bin/sh\nfor last; do :; done\ncp \"$3\" \"$last\"\n").unwrap();
        std::fs::set_permissions(&encoder, std::fs::Permissions::from_mode(0o755)).unwrap();
        encoder
    }

    async fn seeded_blobs(dir: &Path) -> Arc<LocalBlobStore> {
        let blobs = Arc::new(LocalBlobStore::new(dir.join("blobs")));
        blobs
            .put("tracks", "u/1/original/hello.wav", Bytes::from_static(b"hello world!"))
            .await
            .unwrap();
        blobs
    }

    #[tokio::test]
    async fn basic() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = seeded_blobs(tmp.path()).await;
        let config = OrchestratorConfig {
            workspace_root: tmp.path().join("workspaces"),
            retrieval_root: tmp.path().join("results"),
            encoder: ToolConfig::new(fake_encoder(tmp.path()).to_string_lossy()),
            ..OrchestratorConfig::default()
        };
        let jobs = Arc::new(InMemoryJobRepository::new());
        let orchestrator = Orchestrator::new(config, blobs.clone(), jobs.clone());
        let job_id = Uuid::new_v4();
        let result = orchestrator
            .process_job(
                job_id,
                "u/1/original/hello.wav",
                JobKind::Mp3Conversion,
                JobParameters::default(),
            )
            .await
            .expect("job start err");

        assert_eq!(result.status, JobStatus::Completed);
        let key = &result.artifacts["mp3"];
        assert_eq!(key, "u/1/mp3/mp3.mp3");
        assert_eq!(
            blobs.get("tracks", key).await.unwrap(),
            Bytes::from_static(b"hello world!")
        );
        let stored = jobs.find_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn relative_workspace_root() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = seeded_blobs(tmp.path()).await;
        let relative = PathBuf::from(format!("relative-workspaces-{}", Uuid::new_v4()));
        let config = OrchestratorConfig {
            workspace_root: relative.clone(),
            retrieval_root: tmp.path().join("results"),
            encoder: ToolConfig::new(fake_encoder(tmp.path()).to_string_lossy()),
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::new(config, blobs, Arc::new(InMemoryJobRepository::new()));
        assert!(orchestrator.config().workspace_root.is_absolute());

        let result = orchestrator
            .process_job(
                Uuid::new_v4(),
                "u/1/original/hello.wav",
                JobKind::Mp3Conversion,
                JobParameters::default(),
            )
            .await
            .unwrap();
        let _ = std::fs::remove_dir_all(&relative);

        assert_eq!(result.status, JobStatus::Completed, "{:?}", result.error);
        assert_eq!(result.artifacts["mp3"], "u/1/mp3/mp3.mp3");
    }
}
