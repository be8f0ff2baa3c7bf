//! Typed construction of external tool invocations.
//!
//! Nothing here touches the filesystem or spawns anything: given a job kind, the
//! configured tools and a workspace, the builders return the exact program, argument
//! list, working directory and environment overlay to run.

use crate::config::{OrchestratorConfig, ToolConfig};
use crate::job::JobKind;
use crate::types::{Args, Envs, Program};
use crate::workspace::Workspace;
use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Fully-formed invocation of an external tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: Program,
    pub args: Args,
    pub current_dir: PathBuf,
    pub envs: Envs,
}

impl CommandSpec {
    pub fn new(program: impl Into<Program>, current_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Args::new(),
            current_dir: current_dir.into(),
            envs: Envs::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<Path>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.envs.push((key.into(), val.into()));
        self
    }

    /// Short name used to tag the tool's log lines.
    pub fn tool_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.program)
    }
}

/// A python virtual environment, activated by overlaying the environment rather than
/// sourcing its activate script in a shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualEnv {
    pub root: PathBuf,
}

impl VirtualEnv {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// Resolve a bare program name against the environment's `bin` directory.
    pub fn resolve(&self, program: &str) -> Program {
        if Path::new(program).components().count() == 1 {
            self.bin_dir().join(program).to_string_lossy().into_owned()
        } else {
            program.to_string()
        }
    }

    /// Variables the activate script would export, given the inherited `PATH`.
    pub fn overlay(&self, inherited_path: Option<OsString>) -> Envs {
        let mut dirs = vec![self.bin_dir()];
        if let Some(path) = inherited_path {
            dirs.extend(env::split_paths(&path));
        }
        let path = env::join_paths(dirs)
            .map(|joined| joined.to_string_lossy().into_owned())
            .unwrap_or_else(|_| self.bin_dir().to_string_lossy().into_owned());
        vec![
            (
                "VIRTUAL_ENV".to_string(),
                self.root.to_string_lossy().into_owned(),
            ),
            ("PATH".to_string(), path),
        ]
    }
}

fn activated(tool: &ToolConfig, workspace: &Workspace) -> CommandSpec {
    match &tool.venv {
        Some(root) => {
            let venv = VirtualEnv::new(root);
            let mut spec = CommandSpec::new(venv.resolve(&tool.program), &workspace.root);
            spec.envs = venv.overlay(env::var_os("PATH"));
            spec
        }
        None => CommandSpec::new(tool.program.clone(), &workspace.root),
    }
}

/// Path the encoder writes its single output file to.
pub fn mp3_output_path(workspace: &Workspace) -> PathBuf {
    workspace.output_dir.join("mp3.mp3")
}

/// Build the invocation for `kind` against the files in `workspace`.
pub fn build(kind: &JobKind, config: &OrchestratorConfig, workspace: &Workspace) -> CommandSpec {
    match kind {
        JobKind::StemExtraction { stems } => activated(&config.separator, workspace)
            .arg("separate")
            .arg("-p")
            .arg(format!("spleeter:{}stems", stems))
            .arg("-o")
            .arg(&workspace.output_dir)
            .arg(&workspace.input_path),
        JobKind::TrackAnalysis => {
            let spec = activated(&config.analyzer, workspace);
            let spec = match &config.analyzer.script {
                Some(script) => spec.arg(script),
                None => spec,
            };
            spec.arg(&workspace.input_path)
        }
        JobKind::Mp3Conversion => activated(&config.encoder, workspace)
            .arg("-y")
            .arg("-i")
            .arg(&workspace.input_path)
            .arg("-codec:a")
            .arg("libmp3lame")
            .arg("-qscale:a")
            .arg("2")
            .arg(mp3_output_path(workspace)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace::new(PathBuf::from("/scratch/u1/job"), "song.wav")
    }

    #[test]
    fn stem_extraction_args() {
        let config = OrchestratorConfig::default();
        let spec = build(&JobKind::StemExtraction { stems: 4 }, &config, &workspace());
        assert_eq!(spec.program, "spleeter");
        assert_eq!(
            spec.args,
            vec![
                "separate",
                "-p",
                "spleeter:4stems",
                "-o",
                "/scratch/u1/job/output",
                "/scratch/u1/job/input/song.wav",
            ]
        );
        assert_eq!(spec.current_dir, PathBuf::from("/scratch/u1/job"));
        assert!(spec.envs.is_empty());
    }

    #[test]
    fn venv_activation_overlays_env() {
        let mut config = OrchestratorConfig::default();
        config.analyzer = ToolConfig::new("python3")
            .with_venv("/opt/librosa_env")
            .with_script("/opt/librosa_env/librosa_api.py");
        let spec = build(&JobKind::TrackAnalysis, &config, &workspace());

        assert_eq!(spec.program, "/opt/librosa_env/bin/python3");
        assert_eq!(spec.tool_name(), "python3");
        assert_eq!(
            spec.args,
            vec![
                "/opt/librosa_env/librosa_api.py",
                "/scratch/u1/job/input/song.wav"
            ]
        );
        assert!(spec
            .envs
            .contains(&("VIRTUAL_ENV".to_string(), "/opt/librosa_env".to_string())));
        let (_, path) = spec.envs.iter().find(|(k, _)| k == "PATH").unwrap();
        assert!(path.starts_with("/opt/librosa_env/bin"));
    }

    #[test]
    fn venv_keeps_explicit_program_paths() {
        let venv = VirtualEnv::new("/opt/env");
        assert_eq!(venv.resolve("/usr/bin/python3"), "/usr/bin/python3");
        let overlay = venv.overlay(Some(OsString::from("/usr/bin:/bin")));
        assert_eq!(overlay[1].1, "/opt/env/bin:/usr/bin:/bin");
    }

    #[test]
    fn mp3_conversion_writes_into_output_dir() {
        let config = OrchestratorConfig::default();
        let spec = build(&JobKind::Mp3Conversion, &config, &workspace());
        assert_eq!(spec.program, "ffmpeg");
        assert_eq!(spec.args.last().unwrap(), "/scratch/u1/job/output/mp3.mp3");
    }
}
