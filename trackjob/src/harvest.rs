use crate::error::{JobError, Result};
use std::{
    collections::BTreeMap,
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::fs;

/// What a harvested file is, derived from its base name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Vocals,
    Drums,
    Bass,
    Piano,
    Accompaniment,
    Other,
    Mp3,
    Analysis,
    /// A name outside the known vocabulary, kept verbatim (lower-cased).
    Unrecognized(String),
}

impl Role {
    pub fn from_name(name: &str) -> Self {
        let name = name.to_lowercase();
        match name.as_str() {
            "vocals" => Role::Vocals,
            "drums" => Role::Drums,
            "bass" => Role::Bass,
            "piano" => Role::Piano,
            "accompaniment" => Role::Accompaniment,
            "other" => Role::Other,
            "mp3" => Role::Mp3,
            "analysis" => Role::Analysis,
            _ => Role::Unrecognized(name),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Vocals => "vocals",
            Role::Drums => "drums",
            Role::Bass => "bass",
            Role::Piano => "piano",
            Role::Accompaniment => "accompaniment",
            Role::Other => "other",
            Role::Mp3 => "mp3",
            Role::Analysis => "analysis",
            Role::Unrecognized(name) => name,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Role::Unrecognized(_))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Files collected from a tool's output directory, by role.
pub type Harvest = BTreeMap<Role, PathBuf>;

/// Walk `output_dir` recursively and classify every `*.<extension>` file.
///
/// Matching is case-insensitive on the extension. Finding nothing at all is an
/// error: the tool most likely failed without saying so.
pub async fn harvest(output_dir: &Path, extension: &str) -> Result<Harvest> {
    let extension = extension.trim_start_matches('.').to_lowercase();
    let no_artifacts = || JobError::NoArtifacts {
        dir: output_dir.to_path_buf(),
        extension: extension.clone(),
    };

    let files = match walk_files(output_dir).await {
        Ok(files) => files,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(no_artifacts()),
        Err(source) => {
            return Err(JobError::Workspace {
                path: output_dir.to_path_buf(),
                source,
            })
        }
    };

    let mut harvested = Harvest::new();
    for path in files {
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase() == extension)
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let stem = match path.file_stem().and_then(|stem| stem.to_str()) {
            Some(stem) => stem,
            None => continue,
        };
        let role = Role::from_name(stem);
        if let Some(previous) = harvested.get(&role) {
            tracing::warn!(role = %role, kept = ?previous, ignored = ?path, "duplicate artifact role");
            continue;
        }
        tracing::debug!(role = %role, path = ?path, "harvested artifact");
        harvested.insert(role, path);
    }

    if harvested.is_empty() {
        return Err(no_artifacts());
    }
    Ok(harvested)
}

/// All regular files below `root`, in a stable order.
async fn walk_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
