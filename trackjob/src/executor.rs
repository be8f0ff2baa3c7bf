use crate::actors::worker::WorkerHandle;
use crate::command::CommandSpec;
use crate::error::ExecutionError;
use crate::events::ProcessStatus;
use crate::types::OutputLine;
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    result,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};

pub type Result<T> = result::Result<T, ExecutionError>;

/// Lines of tool output kept for the caller; older lines are only logged.
pub const MAX_CAPTURED_LINES: usize = 10_000;

/// How long to keep draining output after the tool exited or was killed, when no
/// deadline says otherwise.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Least time given to trailing output once the tool exited close to its deadline.
const DRAIN_FLOOR: Duration = Duration::from_millis(250);

/// A finished tool run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub program: String,
    pub status: ProcessStatus,
    /// Combined stdout and stderr, most recent [`MAX_CAPTURED_LINES`] lines.
    pub output: Vec<OutputLine>,
}

impl ExecutionResult {
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            ProcessStatus::Exited { code } => Some(code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code() == Some(0)
    }

    /// Turn anything but a zero exit into an error.
    pub fn check(&self) -> Result<()> {
        match self.status {
            ProcessStatus::Exited { code: 0 } => Ok(()),
            ProcessStatus::Exited { code } => Err(ExecutionError::NonZeroExit {
                program: self.program.clone(),
                code,
            }),
            ProcessStatus::Killed { signal } => Err(ExecutionError::Killed {
                program: self.program.clone(),
                signal,
            }),
            ProcessStatus::Running => Err(ExecutionError::Wait {
                program: self.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "still running"),
            }),
        }
    }
}

/// Runs an external tool to completion.
///
/// A non-zero exit is still `Ok`: interpreting it is the caller's business. `Err` is
/// reserved for runs that never produced an exit status of their own (spawn failure,
/// timeout, lost child).
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}

/// [`Executor`] spawning real processes.
#[derive(Clone, Debug, Default)]
pub struct ProcessExecutor {
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

type Captured = Arc<Mutex<VecDeque<OutputLine>>>;

fn lock(captured: &Captured) -> MutexGuard<'_, VecDeque<OutputLine>> {
    captured.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait up to `limit` for the collector to see the end of the tool's output, then
/// hand back whatever it captured.
///
/// Output only ends once every process holding the pipes has exited, which includes
/// anything the tool left running in the background.
async fn drain(
    mut collector: JoinHandle<()>,
    captured: &Captured,
    limit: Duration,
    program: &str,
) -> Vec<OutputLine> {
    if time::timeout(limit, &mut collector).await.is_err() {
        tracing::warn!(program, "tool output still open after exit, not waiting for it");
        collector.abort();
    }
    lock(captured).drain(..).collect()
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let program = spec.program.clone();
        let started = Instant::now();
        tracing::info!(program = %program, args = ?spec.args, dir = ?spec.current_dir, "starting tool");

        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let worker = WorkerHandle::spawn(output_tx, spec).map_err(|source| {
            ExecutionError::Spawn {
                program: program.clone(),
                source,
            }
        })?;

        // drain output while the tool runs so a full pipe never blocks it
        let tool = spec.tool_name().to_string();
        let captured: Captured = Arc::default();
        let collector = tokio::spawn({
            let captured = captured.clone();
            async move {
                while let Some(output) = output_rx.recv().await {
                    let line = output.into_line();
                    tracing::info!(tool = %tool, "{}", line);
                    let mut captured = lock(&captured);
                    if captured.len() == MAX_CAPTURED_LINES {
                        captured.pop_front();
                    }
                    captured.push_back(line);
                }
            }
        });

        let waited = match self.timeout {
            Some(limit) => match time::timeout_at(started + limit, worker.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    tracing::warn!(program = %program, secs = limit.as_secs(), "tool timed out, killing it");
                    let _ = worker.stop().await;
                    let _ = worker.wait().await;
                    drain(collector, &captured, DRAIN_GRACE, &program).await;
                    return Err(ExecutionError::TimedOut {
                        program,
                        secs: limit.as_secs(),
                    });
                }
            },
            None => worker.wait().await,
        };

        let status = waited.map_err(|source| ExecutionError::Wait {
            program: program.clone(),
            source,
        })?;
        let drain_limit = match self.timeout {
            Some(limit) => (started + limit)
                .saturating_duration_since(Instant::now())
                .max(DRAIN_FLOOR),
            None => DRAIN_GRACE,
        };
        let output = drain(collector, &captured, drain_limit, &program).await;
        tracing::info!(program = %program, status = ?status, "tool finished");
        Ok(ExecutionResult {
            program,
            status,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", std::env::temp_dir())
            .arg("-c")
            .arg(script)
    }

    #[tokio::test]
    async fn captures_merged_output() {
        let result = ProcessExecutor::new(None)
            .run(&sh("echo first; echo second >&2; echo third"))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.output.len(), 3);
        assert!(result.output.contains(&"second".to_string()));
        result.check().unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let result = ProcessExecutor::new(None)
            .run(&sh("echo boom; exit 3"))
            .await
            .unwrap();
        assert_eq!(result.exit_code(), Some(3));
        assert!(matches!(
            result.check(),
            Err(ExecutionError::NonZeroExit { code: 3, .. })
        ));
    }

    #[tokio::test]
    async fn spawn_failure_is_distinct() {
        let spec = CommandSpec::new("/definitely/not/a/tool", std::env::temp_dir());
        let err = ProcessExecutor::new(None).run(&spec).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn env_overlay_reaches_the_tool() {
        let spec = sh("echo $TRACKJOB_MARKER").env("TRACKJOB_MARKER", "present");
        let result = ProcessExecutor::new(None).run(&spec).await.unwrap();
        assert_eq!(result.output, vec!["present".to_string()]);
    }

    #[tokio::test]
    async fn runaway_tool_is_killed() {
        let executor = ProcessExecutor::new(Some(Duration::from_millis(200)));
        let started = std::time::Instant::now();
        let err = executor.run(&sh("exec sleep 30")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn background_helper_does_not_outlast_the_deadline() {
        let executor = ProcessExecutor::new(Some(Duration::from_millis(500)));
        let started = std::time::Instant::now();
        let result = executor.run(&sh("sleep 5 & echo hi")).await.unwrap();
        assert!(result.success());
        assert_eq!(result.output, vec!["hi".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn large_output_does_not_deadlock() {
        let result = ProcessExecutor::new(Some(Duration::from_secs(30)))
            .run(&sh("i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done"))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.output.len(), MAX_CAPTURED_LINES);
        assert_eq!(result.output.last().unwrap(), "line 19999");
    }
}
