//! End-to-end job lifecycle.
//!
//! ```text
//! claim -> PROCESSING (persisted) -> workspace -> download -> tool -> harvest -> upload
//!     -> COMPLETED | FAILED (persisted)
//! and, whatever happened after the claim, the workspace is destroyed.
//! ```
//!
//! A job id is run by at most one invocation at a time. An invocation turned away
//! because the job is already processing never touches that job's workspace.
//!
//! `process_job` blocks for as long as the external tool runs, which can be
//! minutes. Callers on a latency-sensitive path should use
//! [`Orchestrator::spawn_job`] instead.

use crate::blob::BlobStore;
use crate::command;
use crate::config::{OrchestratorConfig, UnrecognizedRolePolicy};
use crate::error::{JobError, Result};
use crate::events::JobStatus;
use crate::executor::{Executor, ProcessExecutor};
use crate::harvest::{self, Harvest};
use crate::job::{Job, JobKind, JobParameters, JobResult, TrackAnalysis};
use crate::repository::JobRepository;
use crate::retrieval;
use crate::types::JobId;
use crate::workspace::{LocalWorkspaceManager, Workspace, WorkspaceManager};
use futures::future::join_all;
use std::{
    collections::HashSet,
    env,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{fs, task::JoinHandle};

/// Blob prefix artifacts of `kind` are stored under.
///
/// `base` wins when given. Otherwise the prefix is the source key's directory, with a
/// trailing `original` segment dropped: `u/7/t/42/original/a.wav` gives `u/7/t/42/stems`.
pub fn artifact_prefix(source_key: &str, kind: &JobKind, base: Option<&str>) -> String {
    let base = match base {
        Some(base) => base.trim_end_matches('/').to_string(),
        None => {
            let mut segments: Vec<&str> = source_key.split('/').collect();
            segments.pop();
            if segments.last() == Some(&"original") {
                segments.pop();
            }
            segments.join("/")
        }
    };
    if base.is_empty() {
        kind.artifact_dir().to_string()
    } else {
        format!("{}/{}", base, kind.artifact_dir())
    }
}

fn source_file_name(source_key: &str) -> &str {
    match source_key.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => "source",
    }
}

/// Job ids currently being run by an orchestrator or any of its clones.
#[derive(Clone, Default)]
struct Claims(Arc<Mutex<HashSet<JobId>>>);

impl Claims {
    fn acquire(&self, job_id: JobId) -> Option<Claim> {
        let mut held = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(job_id).then(|| Claim {
            claims: self.clone(),
            job_id,
        })
    }

    fn is_held(&self, job_id: JobId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&job_id)
    }
}

/// Exclusive right to run one job id. Released on drop, including when the running
/// task is aborted.
struct Claim {
    claims: Claims,
    job_id: JobId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

/// What a successful run leaves behind besides the artifacts recorded on the job.
struct Executed {
    analysis: Option<TrackAnalysis>,
    result_set: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobRepository>,
    workspaces: Arc<dyn WorkspaceManager>,
    executor: Arc<dyn Executor>,
    claims: Claims,
}

impl Orchestrator {
    /// Orchestrator running real processes in local workspaces.
    ///
    /// Relative paths in `config` are resolved against the current directory here,
    /// since tools run with the job's workspace as their working directory.
    pub fn new(
        config: OrchestratorConfig,
        blobs: Arc<dyn BlobStore>,
        jobs: Arc<dyn JobRepository>,
    ) -> Self {
        let config = match env::current_dir() {
            Ok(cwd) => config.anchored_at(&cwd),
            Err(err) => {
                tracing::warn!(error = %err, "no current directory, using configured paths as given");
                config
            }
        };
        let executor = Arc::new(ProcessExecutor::new(config.execution_timeout));
        Self {
            config,
            blobs,
            jobs,
            workspaces: Arc::new(LocalWorkspaceManager::new()),
            executor,
            claims: Claims::default(),
        }
    }

    pub fn with_workspaces(mut self, workspaces: Arc<dyn WorkspaceManager>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Accept a request: record the job as PENDING against `source_key`.
    pub async fn submit(&self, job_id: JobId, source_key: &str) -> Result<Job> {
        let mut job = self
            .jobs
            .find_by_id(job_id)
            .await?
            .unwrap_or_else(|| Job::new(job_id));
        job.bind_source(source_key)?;
        job.resubmit()?;
        self.jobs.save(&job).await?;
        tracing::info!(job_id = %job_id, source_key, "job submitted");
        Ok(job)
    }

    /// Run one job to a terminal status.
    ///
    /// `Ok` carries the outcome of the job, FAILED included. `Err` means the job could
    /// not be started or its terminal status could not be persisted.
    pub async fn process_job(
        &self,
        job_id: JobId,
        source_key: &str,
        kind: JobKind,
        params: JobParameters,
    ) -> Result<JobResult> {
        let _claim = self
            .claims
            .acquire(job_id)
            .ok_or(JobError::AlreadyProcessing(job_id))?;
        let workspace = Workspace::scoped(
            &self.config.workspace_root,
            params.owner.as_deref(),
            job_id,
            source_file_name(source_key),
        );

        let outcome = match self.begin(job_id, source_key).await {
            // the record says another run owns this job, and with it the workspace
            Err(err @ JobError::AlreadyProcessing(_)) => return Err(err),
            Err(err) => Err(err),
            Ok(job) => self.run_job(job, source_key, &kind, &params, &workspace).await,
        };

        if let Err(err) = self.workspaces.destroy(&workspace.root).await {
            tracing::error!(job_id = %job_id, error = %err, "workspace teardown failed");
        }
        outcome
    }

    /// [`process_job`](Self::process_job) on a background task.
    pub fn spawn_job(
        &self,
        job_id: JobId,
        source_key: String,
        kind: JobKind,
        params: JobParameters,
    ) -> JoinHandle<Result<JobResult>> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator
                .process_job(job_id, &source_key, kind, params)
                .await
        })
    }

    /// Fail a job left in PROCESSING by a run that never finished, e.g. after a crash.
    ///
    /// A job this orchestrator is still running is not stuck and is left alone.
    pub async fn abandon_stuck(&self, job_id: JobId) -> Result<Job> {
        if self.claims.is_held(job_id) {
            return Err(JobError::AlreadyProcessing(job_id));
        }
        let mut job = self
            .jobs
            .find_by_id(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        job.fail("abandoned while processing")?;
        self.jobs.save(&job).await?;
        tracing::warn!(job_id = %job_id, "stuck job marked failed");
        Ok(job)
    }

    async fn run_job(
        &self,
        mut job: Job,
        source_key: &str,
        kind: &JobKind,
        params: &JobParameters,
        workspace: &Workspace,
    ) -> Result<JobResult> {
        let job_id = job.id;
        tracing::info!(job_id = %job_id, kind = %kind, source_key, "job processing");

        let mut result_set = None;
        let mut failure = None;
        match self
            .execute(&mut job, source_key, kind, params, workspace)
            .await
        {
            Ok(executed) => {
                job.analysis = executed.analysis;
                job.transition(JobStatus::Completed)?;
                result_set = executed.result_set;
                tracing::info!(job_id = %job_id, artifacts = job.artifacts.len(), "job completed");
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "job failed");
                job.fail(&err)?;
                failure = Some(err);
            }
        }

        self.jobs.save(&job).await?;
        Ok(JobResult {
            job_id,
            status: job.status,
            artifacts: job.artifacts,
            analysis: job.analysis,
            result_set,
            error: failure,
        })
    }

    /// Load or create the job and persist it as PROCESSING.
    async fn begin(&self, job_id: JobId, source_key: &str) -> Result<Job> {
        let mut job = self
            .jobs
            .find_by_id(job_id)
            .await?
            .unwrap_or_else(|| Job::new(job_id));
        job.bind_source(source_key)?;
        if job.status != JobStatus::Pending {
            job.resubmit()?;
        }
        job.transition(JobStatus::Processing)?;
        self.jobs.save(&job).await?;
        Ok(job)
    }

    async fn execute(
        &self,
        job: &mut Job,
        source_key: &str,
        kind: &JobKind,
        params: &JobParameters,
        workspace: &Workspace,
    ) -> Result<Executed> {
        self.workspaces.create(workspace).await?;

        self.blobs
            .get_to_file(&self.config.source_bucket, source_key, &workspace.input_path)
            .await
            .map_err(|source| JobError::Download {
                key: source_key.to_string(),
                source,
            })?;
        tracing::debug!(job_id = %job.id, path = ?workspace.input_path, "source downloaded");

        let spec = command::build(kind, &self.config, workspace);
        let execution = self.executor.run(&spec).await?;
        execution.check()?;

        let analysis = match kind {
            JobKind::TrackAnalysis => {
                let analysis = TrackAnalysis::from_output(&execution.output)?;
                let report = workspace.output_dir.join("analysis.json");
                let body = serde_json::to_vec_pretty(&analysis)
                    .map_err(|e| JobError::Analysis(e.to_string()))?;
                fs::write(&report, body)
                    .await
                    .map_err(|source| JobError::Workspace {
                        path: report.clone(),
                        source,
                    })?;
                Some(analysis)
            }
            _ => None,
        };

        let harvested = harvest::harvest(&workspace.output_dir, kind.extension()).await?;
        let missing: Vec<_> = kind
            .expected_roles()
            .into_iter()
            .filter(|role| !harvested.contains_key(role))
            .collect();
        if !missing.is_empty() {
            tracing::warn!(job_id = %job.id, missing = ?missing, "tool produced fewer artifacts than expected");
        }

        let published = self
            .upload(job, source_key, kind, params, harvested)
            .await?;

        let result_set = if params.publish_for_retrieval {
            match retrieval::publish(&self.config.retrieval_root, job.id, &published).await {
                Ok(dir) => Some(dir),
                Err(err) => {
                    tracing::error!(job_id = %job.id, error = %err, "could not publish result set");
                    None
                }
            }
        } else {
            None
        };

        Ok(Executed {
            analysis,
            result_set,
        })
    }

    /// Upload every harvested artifact concurrently, recording each one that lands.
    ///
    /// Returns the `(file name, local path)` of each uploaded artifact.
    async fn upload(
        &self,
        job: &mut Job,
        source_key: &str,
        kind: &JobKind,
        params: &JobParameters,
        harvested: Harvest,
    ) -> Result<Vec<(String, PathBuf)>> {
        let prefix = artifact_prefix(source_key, kind, params.base_prefix.as_deref());
        let bucket = &self.config.artifact_bucket;

        let candidates: Vec<_> = harvested
            .into_iter()
            .filter(|(role, path)| {
                let keep = role.is_recognized()
                    || self.config.unrecognized_roles == UnrecognizedRolePolicy::Store;
                if !keep {
                    tracing::warn!(job_id = %job.id, role = %role, path = ?path, "skipping unrecognized artifact");
                }
                keep
            })
            .collect();
        if candidates.is_empty() {
            return Err(JobError::NoArtifacts {
                dir: PathBuf::from(&prefix),
                extension: kind.extension().to_string(),
            });
        }

        let uploads = candidates.into_iter().map(|(role, path)| {
            let file_name = format!("{}.{}", role, kind.extension());
            let key = format!("{}/{}", prefix, file_name);
            async move {
                let outcome = self.blobs.put_file(bucket, &key, &path).await;
                (role, key, file_name, path, outcome)
            }
        });

        let mut attempted = 0;
        let mut published = Vec::new();
        for (role, key, file_name, path, outcome) in join_all(uploads).await {
            attempted += 1;
            match outcome {
                Ok(()) => {
                    tracing::info!(job_id = %job.id, role = %role, key = %key, "artifact uploaded");
                    job.record_artifact(role.as_str(), &key);
                    published.push((file_name, path));
                }
                Err(source) => {
                    let err = JobError::Upload { key, source };
                    tracing::error!(job_id = %job.id, role = %role, error = %err, "artifact upload failed");
                }
            }
        }

        if job.artifacts.is_empty() {
            return Err(JobError::AllUploadsFailed { attempted });
        }
        Ok(published)
    }
}
