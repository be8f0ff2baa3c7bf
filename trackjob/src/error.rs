use crate::events::JobStatus;
use crate::types::JobId;
use std::{io, path::PathBuf, result};

/// Failures raised by a [`BlobStore`](crate::blob::BlobStore).
#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("no object at {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures raised by a [`JobRepository`](crate::repository::JobRepository).
#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("job store i/o: {0}")]
    Io(#[from] io::Error),
    #[error("job store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Why an external tool did not produce a usable run.
#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{program} exited with code {code}")]
    NonZeroExit { program: String, code: i32 },
    #[error("{program} was killed by signal {signal}")]
    Killed { program: String, signal: i32 },
    #[error("{program} did not finish within {secs}s and was killed")]
    TimedOut { program: String, secs: u64 },
    #[error("lost track of {program}: {source}")]
    Wait { program: String, source: io::Error },
}

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("workspace {path:?}: {source}")]
    Workspace { path: PathBuf, source: io::Error },
    #[error("download of {key} failed: {source}")]
    Download { key: String, source: BlobError },
    #[error("upload of {key} failed: {source}")]
    Upload { key: String, source: BlobError },
    #[error("all {attempted} artifact uploads failed")]
    AllUploadsFailed { attempted: usize },
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("no *.{extension} artifacts under {dir:?}")]
    NoArtifacts { dir: PathBuf, extension: String },
    #[error("analysis report unusable: {0}")]
    Analysis(String),
    #[error("job record: {0}")]
    Persistence(#[from] RepositoryError),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {0} is already processing")]
    AlreadyProcessing(JobId),
    #[error("job {job_id} is bound to source {current}, not {requested}")]
    SourceKeyMismatch {
        job_id: JobId,
        current: String,
        requested: String,
    },
    #[error("job {0} does not exist")]
    NotFound(JobId),
    #[error("invalid job request: {0}")]
    InvalidRequest(String),
    #[error("result set {0:?} is not retrievable")]
    UnknownResultSet(PathBuf),
    #[error("retention tracker stopped")]
    TrackerStopped,
}

pub type Result<T> = result::Result<T, JobError>;
