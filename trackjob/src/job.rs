use crate::error::{JobError, Result};
use crate::events::JobStatus;
use crate::harvest::Role;
use crate::types::{ArtifactKeys, JobId, OutputLine};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// Stem counts the separation tool ships pretrained models for.
pub const SUPPORTED_STEM_COUNTS: [u8; 3] = [2, 4, 5];

/// What the external tool does to the source object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Spectral/beat analysis reported as JSON on the tool's stdout.
    TrackAnalysis,
    /// Source separation into `stems` wav files.
    StemExtraction { stems: u8 },
    /// Re-encode the source as mp3.
    Mp3Conversion,
}

impl JobKind {
    pub fn stem_extraction(stems: u8) -> Result<Self> {
        if SUPPORTED_STEM_COUNTS.contains(&stems) {
            Ok(JobKind::StemExtraction { stems })
        } else {
            Err(JobError::InvalidRequest(format!(
                "unsupported stem count {} (expected one of {:?})",
                stems, SUPPORTED_STEM_COUNTS
            )))
        }
    }

    /// Extension of the files the harvester collects for this kind.
    pub fn extension(&self) -> &'static str {
        match self {
            JobKind::TrackAnalysis => "json",
            JobKind::StemExtraction { .. } => "wav",
            JobKind::Mp3Conversion => "mp3",
        }
    }

    /// Sub-prefix under the job's base prefix where artifacts are stored.
    pub fn artifact_dir(&self) -> &'static str {
        match self {
            JobKind::TrackAnalysis => "analysis",
            JobKind::StemExtraction { .. } => "stems",
            JobKind::Mp3Conversion => "mp3",
        }
    }

    pub fn expected_roles(&self) -> Vec<Role> {
        use Role::*;
        match self {
            JobKind::TrackAnalysis => vec![Analysis],
            JobKind::StemExtraction { stems: 2 } => vec![Vocals, Accompaniment],
            JobKind::StemExtraction { stems: 4 } => vec![Vocals, Drums, Bass, Other],
            JobKind::StemExtraction { stems: 5 } => vec![Vocals, Drums, Bass, Piano, Other],
            JobKind::StemExtraction { .. } => vec![],
            JobKind::Mp3Conversion => vec![Mp3],
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::TrackAnalysis => write!(f, "track analysis"),
            JobKind::StemExtraction { stems } => write!(f, "{}-stem extraction", stems),
            JobKind::Mp3Conversion => write!(f, "mp3 conversion"),
        }
    }
}

/// Per-request knobs that are not part of the job's identity.
#[derive(Clone, Debug, Default)]
pub struct JobParameters {
    /// Blob prefix artifacts are stored under. Derived from the source key when absent.
    pub base_prefix: Option<String>,
    /// Scopes the local workspace, e.g. the requesting user's id.
    pub owner: Option<String>,
    /// Copy harvested files into a retrievable result set before teardown.
    pub publish_for_retrieval: bool,
}

/// Report printed by the analysis tool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackAnalysis {
    pub tempo: f64,
    pub spectral_centroid: f64,
    pub rms: f64,
    #[serde(default = "unknown_key")]
    pub key: String,
    #[serde(default)]
    pub beats: Vec<i64>,
    #[serde(default)]
    pub melody: Vec<f64>,
    #[serde(default)]
    pub mfcc: Vec<f64>,
    #[serde(default)]
    pub spectral_features: serde_json::Value,
}

fn unknown_key() -> String {
    "Unknown".to_string()
}

impl TrackAnalysis {
    /// Pick the report out of the tool's combined output.
    ///
    /// The report is the last line holding a JSON object; anything the tool logged
    /// before it is ignored.
    pub fn from_output(lines: &[OutputLine]) -> Result<Self> {
        let report = lines
            .iter()
            .rev()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
            .find(|value| value.is_object())
            .ok_or_else(|| JobError::Analysis("tool printed no JSON report".to_string()))?;

        if let Some(err) = report.get("error") {
            let msg = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
            return Err(JobError::Analysis(msg));
        }
        serde_json::from_value(report).map_err(|e| JobError::Analysis(e.to_string()))
    }
}

/// Persisted state of one analysis/separation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_key: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub artifacts: ArtifactKeys,
    #[serde(default)]
    pub analysis: Option<TrackAnalysis>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            source_key: None,
            status: JobStatus::Pending,
            artifacts: ArtifactKeys::new(),
            analysis: None,
            error: None,
        }
    }

    /// Attach the source object. A key, once set, never changes.
    pub fn bind_source(&mut self, key: &str) -> Result<()> {
        match &self.source_key {
            Some(current) if current != key => Err(JobError::SourceKeyMismatch {
                job_id: self.id,
                current: current.clone(),
                requested: key.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.source_key = Some(key.to_string());
                Ok(())
            }
        }
    }

    /// Start a fresh submission cycle, discarding the outcome of the previous one.
    pub fn resubmit(&mut self) -> Result<()> {
        if self.status == JobStatus::Processing {
            return Err(JobError::AlreadyProcessing(self.id));
        }
        self.status = JobStatus::Pending;
        self.artifacts.clear();
        self.analysis = None;
        self.error = None;
        Ok(())
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn record_artifact(&mut self, role: &str, key: &str) {
        self.artifacts.insert(role.to_string(), key.to_string());
    }

    /// Move to `Failed`. A failed job references no artifacts.
    pub fn fail(&mut self, reason: impl fmt::Display) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.artifacts.clear();
        self.analysis = None;
        self.error = Some(reason.to_string());
        Ok(())
    }
}

/// Outcome handed back to the caller of `process_job`.
#[derive(Debug)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub artifacts: ArtifactKeys,
    pub analysis: Option<TrackAnalysis>,
    /// Directory of published artifacts, when publication was requested.
    pub result_set: Option<PathBuf>,
    /// Why the job failed.
    pub error: Option<JobError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn stem_counts_are_validated() {
        assert!(JobKind::stem_extraction(4).is_ok());
        assert!(matches!(
            JobKind::stem_extraction(3),
            Err(JobError::InvalidRequest(_))
        ));
    }

    #[test]
    fn source_key_is_immutable() {
        let mut job = Job::new(Uuid::new_v4());
        job.bind_source("a/original/x.wav").unwrap();
        job.bind_source("a/original/x.wav").unwrap();
        assert!(matches!(
            job.bind_source("b/original/y.wav"),
            Err(JobError::SourceKeyMismatch { .. })
        ));
    }

    #[test]
    fn resubmission_resets_terminal_job() {
        let mut job = Job::new(Uuid::new_v4());
        job.transition(JobStatus::Processing).unwrap();
        assert!(matches!(job.resubmit(), Err(JobError::AlreadyProcessing(_))));

        job.record_artifact("vocals", "t/stems/vocals.wav");
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.transition(JobStatus::Processing).is_err());

        job.resubmit().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.artifacts.is_empty());
        job.transition(JobStatus::Processing).unwrap();
    }

    #[test]
    fn failing_drops_artifacts() {
        let mut job = Job::new(Uuid::new_v4());
        job.transition(JobStatus::Processing).unwrap();
        job.record_artifact("drums", "t/stems/drums.wav");
        job.fail(&JobError::AllUploadsFailed { attempted: 1 }).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.artifacts.is_empty());
        assert!(job.error.is_some());
    }

    #[test]
    fn analysis_report_is_last_json_line() {
        let lines = vec![
            "loading model".to_string(),
            r#"{"tempo": 120.5, "spectral_centroid": 1800.0, "rms": 0.12, "beats": [1, 5, 9]}"#
                .to_string(),
        ];
        let analysis = TrackAnalysis::from_output(&lines).unwrap();
        assert_eq!(analysis.tempo, 120.5);
        assert_eq!(analysis.key, "Unknown");
        assert_eq!(analysis.beats, vec![1, 5, 9]);
        assert!(analysis.mfcc.is_empty());
    }

    #[test]
    fn analysis_error_report() {
        let lines = vec![r#"{"error": "could not decode"}"#.to_string()];
        match TrackAnalysis::from_output(&lines) {
            Err(JobError::Analysis(msg)) => assert_eq!(msg, "could not decode"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(TrackAnalysis::from_output(&["no json here".to_string()]).is_err());
    }
}
