use clap::{ArgEnum, Args, Parser, Subcommand};
use std::{path::PathBuf, time::Duration};
use trackjob::{JobError, JobKind, OrchestratorConfig, ToolConfig, UnrecognizedRolePolicy};
use uuid::Uuid;

/// Run media jobs against a local blob store
#[derive(Debug, Parser)]
#[clap(name = "trackjob")]
pub struct ArgParser {
    #[clap(flatten)]
    pub storage: StorageArgs,
    #[clap(flatten)]
    pub tools: ToolArgs,
    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Debug, Args)]
pub struct StorageArgs {
    /// directory holding one sub-directory per bucket
    #[clap(long, env = "TRACKJOB_BLOB_ROOT", default_value = "blobs", parse(from_os_str))]
    pub blob_root: PathBuf,

    /// bucket source objects are read from
    #[clap(long, env = "TRACKJOB_SOURCE_BUCKET", default_value = "tracks")]
    pub source_bucket: String,

    /// bucket artifacts are written to
    #[clap(long, env = "TRACKJOB_ARTIFACT_BUCKET", default_value = "tracks")]
    pub artifact_bucket: String,

    /// parent of per-job workspaces
    #[clap(long, env = "TRACKJOB_WORKSPACE_ROOT", parse(from_os_str))]
    pub workspace_root: Option<PathBuf>,

    /// parent of published result sets
    #[clap(long, env = "TRACKJOB_RETRIEVAL_ROOT", parse(from_os_str))]
    pub retrieval_root: Option<PathBuf>,

    /// JSON file job records are kept in
    #[clap(long, env = "TRACKJOB_STATE_FILE", default_value = "jobs.json", parse(from_os_str))]
    pub state_file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ToolArgs {
    /// stem separation executable
    #[clap(long, env = "TRACKJOB_SPLEETER", default_value = "spleeter")]
    pub spleeter: String,

    /// virtual environment spleeter is installed in
    #[clap(long, env = "TRACKJOB_SPLEETER_VENV", parse(from_os_str))]
    pub spleeter_venv: Option<PathBuf>,

    /// interpreter running the analysis script
    #[clap(long, env = "TRACKJOB_PYTHON", default_value = "python3")]
    pub python: String,

    /// analysis script printing its report as JSON
    #[clap(long, env = "TRACKJOB_ANALYSIS_SCRIPT", default_value = "librosa_api.py", parse(from_os_str))]
    pub analysis_script: PathBuf,

    /// virtual environment the analysis script runs in
    #[clap(long, env = "TRACKJOB_ANALYSIS_VENV", parse(from_os_str))]
    pub analysis_venv: Option<PathBuf>,

    /// mp3 encoder executable
    #[clap(long, env = "TRACKJOB_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// kill a tool after this many seconds, 0 to wait forever
    #[clap(long, env = "TRACKJOB_TIMEOUT_SECS", default_value = "1800")]
    pub timeout_secs: u64,

    /// also store artifacts whose role is not recognized
    #[clap(long, env = "TRACKJOB_STORE_UNRECOGNIZED")]
    pub store_unrecognized: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum SubCommand {
    /// process one job to completion
    Run {
        /// Uuid v4 string, generated when absent
        #[clap(long)]
        job_id: Option<Uuid>,

        /// key of the source object
        #[clap(long)]
        source_key: String,

        /// what to do with the source
        #[clap(long, arg_enum)]
        kind: KindArg,

        /// number of stems to separate into
        #[clap(long, default_value = "4")]
        stems: u8,

        /// prefix to store artifacts under instead of the source's
        #[clap(long)]
        base_prefix: Option<String>,

        /// scope the workspace under this owner
        #[clap(long)]
        owner: Option<String>,

        /// keep a copy of the artifacts in a retrievable result set
        #[clap(long)]
        publish: bool,
    },
    /// print a job's stored record
    Status {
        /// Uuid v4 string
        job_id: Uuid,
    },
    /// fail a job left processing by a run that never finished
    Abandon {
        /// Uuid v4 string
        job_id: Uuid,
    },
    /// delete every artifact under a prefix
    Purge {
        /// key prefix in the artifact bucket
        prefix: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum)]
pub enum KindArg {
    /// tempo, key and spectral analysis
    Analysis,
    /// source separation
    Stems,
    /// mp3 re-encode
    Mp3,
}

impl KindArg {
    pub fn into_job_kind(self, stems: u8) -> Result<JobKind, JobError> {
        match self {
            KindArg::Analysis => Ok(JobKind::TrackAnalysis),
            KindArg::Stems => JobKind::stem_extraction(stems),
            KindArg::Mp3 => Ok(JobKind::Mp3Conversion),
        }
    }
}

fn tool(program: &str, venv: &Option<PathBuf>) -> ToolConfig {
    let tool = ToolConfig::new(program);
    match venv {
        Some(venv) => tool.with_venv(venv),
        None => tool,
    }
}

impl ArgParser {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        let tools = &self.tools;
        OrchestratorConfig {
            workspace_root: self
                .storage
                .workspace_root
                .clone()
                .unwrap_or(defaults.workspace_root),
            retrieval_root: self
                .storage
                .retrieval_root
                .clone()
                .unwrap_or(defaults.retrieval_root),
            source_bucket: self.storage.source_bucket.clone(),
            artifact_bucket: self.storage.artifact_bucket.clone(),
            separator: tool(&tools.spleeter, &tools.spleeter_venv),
            analyzer: tool(&tools.python, &tools.analysis_venv)
                .with_script(&tools.analysis_script),
            encoder: ToolConfig::new(&tools.ffmpeg),
            execution_timeout: match tools.timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            unrecognized_roles: if tools.store_unrecognized {
                UnrecognizedRolePolicy::Store
            } else {
                UnrecognizedRolePolicy::Skip
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults() {
        let args = ArgParser::try_parse_from([
            "trackjob",
            "run",
            "--source-key",
            "u/1/original/a.wav",
            "--kind",
            "stems",
        ])
        .unwrap();
        match args.sub_command {
            SubCommand::Run {
                job_id,
                kind,
                stems,
                publish,
                ..
            } => {
                assert!(job_id.is_none());
                assert_eq!(kind.into_job_kind(stems).unwrap(), JobKind::StemExtraction { stems: 4 });
                assert!(!publish);
            }
            other => panic!("parsed {:?}", other),
        }
        let config = args.orchestrator_config();
        assert_eq!(config.separator.program, "spleeter");
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(config.unrecognized_roles, UnrecognizedRolePolicy::Skip);
    }

    #[test]
    fn tool_options_reach_config() {
        let args = ArgParser::try_parse_from([
            "trackjob",
            "--analysis-venv",
            "/opt/librosa_env",
            "--timeout-secs",
            "0",
            "--store-unrecognized",
            "status",
            "6c1f0f43-7d1b-4a52-9d0c-0f6b2d1e1a11",
        ])
        .unwrap();
        let config = args.orchestrator_config();
        assert_eq!(config.analyzer.venv, Some(PathBuf::from("/opt/librosa_env")));
        assert_eq!(config.analyzer.script, Some(PathBuf::from("librosa_api.py")));
        assert_eq!(config.execution_timeout, None);
        assert_eq!(config.unrecognized_roles, UnrecognizedRolePolicy::Store);
    }

    #[test]
    fn unsupported_stem_count_is_rejected() {
        assert!(KindArg::Stems.into_job_kind(3).is_err());
        assert!(KindArg::Mp3.into_job_kind(3).is_ok());
    }
}
