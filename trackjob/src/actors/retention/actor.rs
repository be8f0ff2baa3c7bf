use super::messages::RetentionMessage;
use crate::error::{self, JobError};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tokio::{fs, sync::mpsc};

struct Entry {
    retrieved: usize,
    total: usize,
    first_retrieved: Instant,
}

/// Owns the retrieval counters. Messages are handled one at a time, so each
/// increment-and-compare is a single step no other caller can interleave with.
pub struct RetentionTracker {
    inbox: mpsc::Receiver<RetentionMessage>,
    entries: HashMap<PathBuf, Entry>,
}

impl RetentionTracker {
    pub fn spawn(inbox: mpsc::Receiver<RetentionMessage>) {
        let actor = Self {
            inbox,
            entries: HashMap::new(),
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        use self::RetentionMessage::*;
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                RecordRetrieval {
                    result_set,
                    response,
                } => {
                    let result_set = normalize(result_set).await;
                    let outcome = self.record_retrieval(result_set).await;
                    let _ = response.send(outcome);
                }
                Release {
                    result_set,
                    response,
                } => {
                    let result_set = normalize(result_set).await;
                    let _ = response.send(self.entries.remove(&result_set).is_some());
                }
                Sweep { max_age, response } => {
                    let _ = response.send(self.sweep(max_age));
                }
                Tracked { response } => {
                    let _ = response.send(self.entries.keys().cloned().collect());
                }
            }
        }
    }

    async fn record_retrieval(&mut self, result_set: PathBuf) -> error::Result<bool> {
        if !self.entries.contains_key(&result_set) {
            let total = count_files(&result_set)
                .await
                .map_err(|_| JobError::UnknownResultSet(result_set.clone()))?;
            if total == 0 {
                return Err(JobError::UnknownResultSet(result_set));
            }
            self.entries.insert(
                result_set.clone(),
                Entry {
                    retrieved: 0,
                    total,
                    first_retrieved: Instant::now(),
                },
            );
        }

        let fully_retrieved = match self.entries.get_mut(&result_set) {
            Some(entry) => {
                entry.retrieved += 1;
                tracing::debug!(
                    result_set = ?result_set,
                    retrieved = entry.retrieved,
                    total = entry.total,
                    "artifact retrieved"
                );
                entry.retrieved >= entry.total
            }
            None => false,
        };

        if fully_retrieved {
            self.entries.remove(&result_set);
            tracing::info!(result_set = ?result_set, "result set fully retrieved");
        }
        Ok(fully_retrieved)
    }

    fn sweep(&mut self, max_age: Duration) -> Vec<PathBuf> {
        let stale: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.first_retrieved.elapsed() >= max_age)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &stale {
            self.entries.remove(path);
            tracing::info!(result_set = ?path, "result set expired before full retrieval");
        }
        stale
    }
}

/// One key per directory however it is spelled: canonical while the directory
/// exists, lexically cleaned (`.` and trailing separators dropped) once it is gone.
async fn normalize(result_set: PathBuf) -> PathBuf {
    match fs::canonicalize(&result_set).await {
        Ok(canonical) => canonical,
        Err(_) => result_set.components().collect(),
    }
}

/// Regular files directly inside `dir`.
async fn count_files(dir: &Path) -> io::Result<usize> {
    let mut count = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}
