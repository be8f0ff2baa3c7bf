use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How the orchestrator treats harvested files whose role it does not know.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnrecognizedRolePolicy {
    /// Log and leave the file out of storage and the job record.
    Skip,
    /// Upload and record it under its raw name.
    Store,
}

/// Where an external tool lives and which environment it runs in.
#[derive(Clone, Debug)]
pub struct ToolConfig {
    /// Executable. A bare name is resolved inside `venv` when one is set.
    pub program: String,
    /// Virtual environment to activate before running the tool.
    pub venv: Option<PathBuf>,
    /// Script handed to an interpreter tool as its first argument.
    pub script: Option<PathBuf>,
}

impl ToolConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            venv: None,
            script: None,
        }
    }

    pub fn with_venv(mut self, venv: impl Into<PathBuf>) -> Self {
        self.venv = Some(venv.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Rebase relative paths on `base`. A bare program name is left for `PATH` lookup.
    pub fn anchored_at(self, base: &Path) -> Self {
        let program = if Path::new(&self.program).components().count() > 1 {
            anchor(base, PathBuf::from(&self.program))
                .to_string_lossy()
                .into_owned()
        } else {
            self.program
        };
        Self {
            program,
            venv: self.venv.map(|venv| anchor(base, venv)),
            script: self.script.map(|script| anchor(base, script)),
        }
    }
}

fn anchor(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Parent of every per-job workspace.
    pub workspace_root: PathBuf,
    /// Parent of every published result set.
    pub retrieval_root: PathBuf,
    pub source_bucket: String,
    pub artifact_bucket: String,
    /// Stem separation tool.
    pub separator: ToolConfig,
    /// Track analysis interpreter plus script.
    pub analyzer: ToolConfig,
    /// mp3 encoder.
    pub encoder: ToolConfig,
    /// Kill the tool after this long. `None` waits forever.
    pub execution_timeout: Option<Duration>,
    pub unrecognized_roles: UnrecognizedRolePolicy,
}

impl OrchestratorConfig {
    /// Rebase every relative path on `base`.
    ///
    /// Tools run inside the job's workspace, so a path they are handed only means the
    /// same thing to them once it is absolute.
    pub fn anchored_at(self, base: &Path) -> Self {
        Self {
            workspace_root: anchor(base, self.workspace_root),
            retrieval_root: anchor(base, self.retrieval_root),
            separator: self.separator.anchored_at(base),
            analyzer: self.analyzer.anchored_at(base),
            encoder: self.encoder.anchored_at(base),
            ..self
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let scratch = env::temp_dir().join("trackjob");
        Self {
            workspace_root: scratch.join("workspaces"),
            retrieval_root: scratch.join("results"),
            source_bucket: "tracks".to_string(),
            artifact_bucket: "tracks".to_string(),
            separator: ToolConfig::new("spleeter"),
            analyzer: ToolConfig::new("python3").with_script("librosa_api.py"),
            encoder: ToolConfig::new("ffmpeg"),
            execution_timeout: Some(DEFAULT_EXECUTION_TIMEOUT),
            unrecognized_roles: UnrecognizedRolePolicy::Skip,
        }
    }
}
