//! Per-job scratch directories.
//!
//! A [`Workspace`] is a directory tree owned by exactly one orchestration run:
//!
//! ```text
//! <workspace_root>/<owner>/<job_id>/
//!     input/<source file>
//!     output/...            (written by the external tool)
//! ```
//!
//! Scoping by owner and job id keeps concurrent jobs from ever touching each
//! other's files.

use crate::error::{JobError, Result};
use crate::types::JobId;
use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

const SHARED_OWNER: &str = "shared";

/// Replace anything outside `[A-Za-z0-9-_.]` so a name is safe as one path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
}

impl Workspace {
    pub fn new(root: PathBuf, input_file_name: &str) -> Self {
        let input_path = root.join("input").join(sanitize_file_name(input_file_name));
        let output_dir = root.join("output");
        Self {
            root,
            input_path,
            output_dir,
        }
    }

    /// Workspace for `job_id`, scoped under `owner` inside `workspace_root`.
    pub fn scoped(
        workspace_root: &Path,
        owner: Option<&str>,
        job_id: JobId,
        input_file_name: &str,
    ) -> Self {
        let owner = owner.map(sanitize_file_name);
        let root = workspace_root
            .join(owner.as_deref().unwrap_or(SHARED_OWNER))
            .join(job_id.to_string());
        Self::new(root, input_file_name)
    }

    pub fn input_dir(&self) -> &Path {
        self.input_path.parent().unwrap_or(&self.root)
    }
}

/// Creates and tears down workspaces.
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Make `workspace` exist and be empty, with its input and output directories in place.
    async fn create(&self, workspace: &Workspace) -> Result<()>;

    /// Remove `path` and everything below it. Absent paths are not an error.
    async fn destroy(&self, path: &Path) -> Result<()>;
}

/// [`WorkspaceManager`] over the local filesystem.
#[derive(Clone, Debug, Default)]
pub struct LocalWorkspaceManager;

impl LocalWorkspaceManager {
    pub fn new() -> Self {
        Self
    }

    /// Delete the immediate entries of an existing directory.
    async fn clear(path: &Path) -> io::Result<()> {
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            let removed = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&entry_path).await
            } else {
                fs::remove_file(&entry_path).await
            };
            if let Err(err) = removed {
                tracing::warn!(path = ?entry_path, error = %err, "failed to clear stale workspace entry");
            }
        }
        Ok(())
    }

    /// Every descendant of `root`, parents before children.
    async fn descendants(root: &Path) -> Vec<(PathBuf, bool)> {
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    if err.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path = ?dir, error = %err, "cannot list workspace directory");
                    }
                    continue;
                }
            };
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        let is_dir = entry
                            .file_type()
                            .await
                            .map(|t| t.is_dir())
                            .unwrap_or(false);
                        if is_dir {
                            pending.push(path.clone());
                        }
                        found.push((path, is_dir));
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(path = ?dir, error = %err, "workspace listing interrupted");
                        break;
                    }
                }
            }
        }
        found
    }
}

#[async_trait]
impl WorkspaceManager for LocalWorkspaceManager {
    async fn create(&self, workspace: &Workspace) -> Result<()> {
        let to_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| JobError::Workspace { path, source }
        };

        if fs::metadata(&workspace.root).await.is_ok() {
            tracing::debug!(path = ?workspace.root, "reusing workspace, clearing stale files");
            Self::clear(&workspace.root)
                .await
                .map_err(to_err(&workspace.root))?;
        }
        fs::create_dir_all(workspace.input_dir())
            .await
            .map_err(to_err(workspace.input_dir()))?;
        fs::create_dir_all(&workspace.output_dir)
            .await
            .map_err(to_err(&workspace.output_dir))?;
        Ok(())
    }

    async fn destroy(&self, path: &Path) -> Result<()> {
        let mut descendants = Self::descendants(path).await;
        // deepest first, so each directory is empty by the time it is removed
        descendants.sort_by_key(|(p, _)| std::cmp::Reverse(p.components().count()));
        for (entry, is_dir) in descendants {
            let removed = if is_dir {
                fs::remove_dir(&entry).await
            } else {
                fs::remove_file(&entry).await
            };
            match removed {
                Ok(()) => tracing::trace!(path = ?entry, "deleted"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(path = ?entry, error = %err, "failed to delete"),
            }
        }

        match fs::remove_dir(path).await {
            Ok(()) => {
                tracing::debug!(path = ?path, "workspace removed");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(JobError::Workspace {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn scoped_paths_are_disjoint() {
        let root = Path::new("/scratch");
        let a = Workspace::scoped(root, Some("7"), Uuid::new_v4(), "my song.wav");
        let b = Workspace::scoped(root, Some("7"), Uuid::new_v4(), "my song.wav");
        assert_ne!(a.root, b.root);
        assert!(a.root.starts_with("/scratch/7"));
        assert_eq!(a.input_path.file_name().unwrap(), "my_song.wav");
        assert_eq!(a.output_dir, a.root.join("output"));

        let shared = Workspace::scoped(root, None, Uuid::new_v4(), "x.wav");
        assert!(shared.root.starts_with("/scratch/shared"));
    }

    #[test]
    fn sanitizing_blocks_traversal() {
        assert_eq!(sanitize_file_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_file_name(".."), "_");
        assert_eq!(sanitize_file_name("Track 01 (mix).wav"), "Track_01__mix_.wav");
    }

    #[tokio::test]
    async fn create_clears_existing_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path().join("job"), "in.wav");
        let manager = LocalWorkspaceManager::new();

        manager.create(&workspace).await.unwrap();
        std::fs::write(&workspace.input_path, b"old").unwrap();
        std::fs::write(workspace.root.join("stray.txt"), b"old").unwrap();
        std::fs::create_dir_all(workspace.output_dir.join("song")).unwrap();
        std::fs::write(workspace.output_dir.join("song/vocals.wav"), b"old").unwrap();

        manager.create(&workspace).await.unwrap();
        assert!(!workspace.input_path.exists());
        assert!(!workspace.root.join("stray.txt").exists());
        assert_eq!(std::fs::read_dir(&workspace.output_dir).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(workspace.input_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn create_reports_unwritable_root() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let workspace = Workspace::new(blocker.join("job"), "in.wav");

        let err = LocalWorkspaceManager::new()
            .create(&workspace)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Workspace { .. }));
    }

    #[tokio::test]
    async fn destroy_is_recursive_and_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path().join("job"), "in.wav");
        let manager = LocalWorkspaceManager::new();
        manager.create(&workspace).await.unwrap();
        std::fs::create_dir_all(workspace.output_dir.join("a/b/c")).unwrap();
        std::fs::write(workspace.output_dir.join("a/b/c/deep.wav"), b"x").unwrap();
        std::fs::write(&workspace.input_path, b"x").unwrap();

        manager.destroy(&workspace.root).await.unwrap();
        assert!(!workspace.root.exists());

        manager.destroy(&workspace.root).await.unwrap();
        manager.destroy(&tmp.path().join("never-existed")).await.unwrap();
    }
}
