use crate::error::RepositoryError;
use crate::job::Job;
use crate::types::JobId;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    result,
};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

pub type Result<T> = result::Result<T, RepositoryError>;

/// Durable storage of job records.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn save(&self, job: &Job) -> Result<()>;
    async fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>>;
}

#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }
}

/// All jobs in one JSON document, rewritten atomically on every save.
pub struct JsonFileJobRepository {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileJobRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<Vec<Job>> {
        match fs::read(&self.path).await {
            Ok(contents) => Ok(serde_json::from_slice(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Write to a sibling temp file, sync it, then rename over the real file.
    async fn write_all(&self, jobs: &[Job]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_vec_pretty(jobs)?;
        let temp_path = temp_path(&self.path);
        let mut temp = fs::File::create(&temp_path).await?;
        temp.write_all(&contents).await?;
        temp.sync_all().await?;
        drop(temp);
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl JobRepository for JsonFileJobRepository {
    async fn save(&self, job: &Job) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.read_all().await?;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        self.write_all(&jobs).await
    }

    async fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.into_iter().find(|j| j.id == job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::JobStatus;
    use uuid::Uuid;

    #[tokio::test]
    async fn json_file_persists_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/jobs.json");
        let repo = JsonFileJobRepository::new(&path);

        let mut job = Job::new(Uuid::new_v4());
        job.bind_source("t/original/a.wav").unwrap();
        repo.save(&job).await.unwrap();
        job.transition(JobStatus::Processing).unwrap();
        repo.save(&job).await.unwrap();
        repo.save(&Job::new(Uuid::new_v4())).await.unwrap();

        let reopened = JsonFileJobRepository::new(&path);
        let found = reopened.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(found, job);
        assert!(reopened.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jobs.json");
        std::fs::write(&path, b"{not json").unwrap();
        let repo = JsonFileJobRepository::new(&path);
        assert!(matches!(
            repo.find_by_id(Uuid::new_v4()).await,
            Err(RepositoryError::Corrupt(_))
        ));
    }
}
