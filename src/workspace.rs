//! Workspace Manager: per-run isolated workspace trees and copy-on-write
//! repository views.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::EngineError;
use crate::run_id::RunId;

/// `<root>/<run_id>/{execution, state, logs, tmp, repos, children/...}` per §3.
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn children_dir(&self) -> PathBuf {
        self.root.join("children")
    }

    pub fn child_dir(&self, child_run_id: &RunId) -> PathBuf {
        self.children_dir().join(child_run_id.as_str())
    }
}

pub struct WorkspaceManager {
    base: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Creates `<base>/<run_id>` with its standard subdirectories.
    pub async fn create_workspace(&self, run_id: &RunId) -> Result<Workspace, EngineError> {
        let root = self.base.join(run_id.as_str());
        for sub in ["execution", "state", "logs", "tmp", "repos", "children"] {
            tokio::fs::create_dir_all(root.join(sub))
                .await
                .map_err(|e| {
                    EngineError::fatal(format!(
                        "failed to create workspace dir {}: {e}",
                        root.join(sub).display()
                    ))
                })?;
        }
        debug!(run_id = %run_id, root = %root.display(), "workspace created");
        Ok(Workspace { root })
    }

    /// Produces a per-workspace view of `repo_path` under `<workspace>/repos/<name>`.
    /// When `isolated`, read-only files are symlinked; any write promotes that
    /// single file to a real copy first (copy-on-write). `.git` directories
    /// are never copied, matching the child-workflow repository-copy rule.
    pub async fn prepare_repository(
        &self,
        workspace: &Workspace,
        repo_path: &Path,
        isolated: bool,
    ) -> Result<PathBuf, EngineError> {
        let name = repo_path
            .file_name()
            .ok_or_else(|| EngineError::validation("repository path has no file name component"))?;
        let dest = workspace.repos_dir().join(name);
        tokio::fs::create_dir_all(&dest).await?;

        if isolated {
            Self::link_share(repo_path, &dest).await?;
        } else {
            Self::copy_excluding_git(repo_path, &dest).await?;
        }
        Ok(dest)
    }

    /// Real recursive copy of `src` into `dest`, skipping any `.git` directory.
    /// Used for child-workflow repository copies, which must never carry
    /// version-control metadata into the isolated child workspace.
    pub async fn copy_excluding_git(src: &Path, dest: &Path) -> Result<(), EngineError> {
        let src = src.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree_excluding_git(&src, &dest))
            .await
            .map_err(|e| EngineError::fatal(format!("copy task panicked: {e}")))??;
        Ok(())
    }

    /// Symlinks every file under `src` into `dest`, preserving directory
    /// structure. A later write through [`Self::promote_to_copy`] replaces a
    /// single symlinked file with a real, independently-writable copy.
    async fn link_share(src: &Path, dest: &Path) -> Result<(), EngineError> {
        let src = src.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || link_share_tree(&src, &dest))
            .await
            .map_err(|e| EngineError::fatal(format!("link task panicked: {e}")))??;
        Ok(())
    }

    /// Copy-on-write promotion: if `path` is a symlink into the shared cache,
    /// replace it with a real copy of its target so writes do not leak back
    /// into the shared source. A plain regular file is left untouched.
    pub async fn promote_to_copy(path: &Path) -> Result<(), EngineError> {
        let metadata = tokio::fs::symlink_metadata(path).await?;
        if !metadata.file_type().is_symlink() {
            return Ok(());
        }
        let target = tokio::fs::read_link(path).await?;
        let contents = tokio::fs::read(&target).await?;
        tokio::fs::remove_file(path).await?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Idempotent: removing an already-missing workspace is a success.
    pub async fn cleanup_workspace(&self, run_id: &RunId) -> Result<(), EngineError> {
        let root = self.base.join(run_id.as_str());
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}

fn copy_tree_excluding_git(src: &Path, dest: &Path) -> Result<(), EngineError> {
    for entry in WalkDir::new(src).into_iter().filter_entry(|e| e.file_name() != ".git") {
        let entry = entry.map_err(|e| EngineError::fatal(format!("walk failed: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| EngineError::fatal(e.to_string()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn link_share_tree(src: &Path, dest: &Path) -> Result<(), EngineError> {
    for entry in WalkDir::new(src).into_iter().filter_entry(|e| e.file_name() != ".git") {
        let entry = entry.map_err(|e| EngineError::fatal(format!("walk failed: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| EngineError::fatal(e.to_string()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(entry.path(), &target)?;
            #[cfg(not(unix))]
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
