use std::sync::Arc;
use trackjob::{
    BlobStore, JobKind, JobParameters, JobRepository, JobStatus, JsonFileJobRepository,
    LocalBlobStore, Orchestrator, OrchestratorConfig,
};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Local wiring of the orchestrator: blobs in a directory, job records in a JSON file.
pub struct Runner {
    orchestrator: Orchestrator,
    blobs: Arc<LocalBlobStore>,
    jobs: Arc<JsonFileJobRepository>,
    artifact_bucket: String,
}

impl Runner {
    pub fn new(config: OrchestratorConfig, blobs: LocalBlobStore, jobs: JsonFileJobRepository) -> Self {
        let blobs = Arc::new(blobs);
        let jobs = Arc::new(jobs);
        let artifact_bucket = config.artifact_bucket.clone();
        let orchestrator = Orchestrator::new(config, blobs.clone(), jobs.clone());
        Self {
            orchestrator,
            blobs,
            jobs,
            artifact_bucket,
        }
    }

    pub async fn run_job(
        &self,
        job_id: Uuid,
        source_key: &str,
        kind: JobKind,
        params: JobParameters,
    ) -> Result<()> {
        println!("Processing job id: {}", job_id);
        let result = self
            .orchestrator
            .process_job(job_id, source_key, kind, params)
            .await?;
        println!("{}", result.status);
        for (role, key) in &result.artifacts {
            println!("  {}: {}", role, key);
        }
        if let Some(analysis) = &result.analysis {
            println!(
                "  tempo {:.1} bpm, key {}, {} beats",
                analysis.tempo,
                analysis.key,
                analysis.beats.len()
            );
        }
        if let Some(dir) = &result.result_set {
            println!("Result set: {}", dir.display());
        }
        match (result.status, result.error) {
            (JobStatus::Failed, Some(err)) => Err(err.into()),
            _ => Ok(()),
        }
    }

    pub async fn query_status(&self, job_id: Uuid) -> Result<()> {
        match self.jobs.find_by_id(job_id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => println!("No job with id: {}", job_id),
        }
        Ok(())
    }

    pub async fn abandon(&self, job_id: Uuid) -> Result<()> {
        let job = self.orchestrator.abandon_stuck(job_id).await?;
        println!("Job {} is now {}", job.id, job.status);
        Ok(())
    }

    pub async fn purge(&self, prefix: &str) -> Result<()> {
        let deleted = self
            .blobs
            .delete_by_prefix(&self.artifact_bucket, prefix)
            .await?;
        println!("Deleted {} objects under {}", deleted, prefix);
        Ok(())
    }
}
