use crate::types::OutputLine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted status of a job.
///
/// `Pending -> Processing -> {Completed, Failed}`. The terminal states only lead back
/// to `Pending` through a new submission, never straight into `Processing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the orchestrator may move a job from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// State of an external tool process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited { code: i32 },
    Killed { signal: i32 },
}

#[derive(Clone, Debug)]
pub enum Output {
    Stdout(OutputLine),
    Stderr(OutputLine),
}

impl Output {
    pub fn into_line(self) -> OutputLine {
        match self {
            Output::Stdout(line) | Output::Stderr(line) => line,
        }
    }
}
