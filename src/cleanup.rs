//! Cleanup Manager (§4.13): age-based orphan garbage collection for child
//! workspaces left behind by crashed or killed runs — the eager cleanup
//! `ChildWorkflowExecutor` performs on its own happy/error path (see
//! `child.rs`) only covers runs that unwound normally.
//!
//! Grounded on `workspace.rs`'s `WalkDir`-based tree walk and idempotent
//! `remove_dir_all` cleanup, generalized to an age + active-marker scan
//! across the whole workspace root instead of a single known run id.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::EngineResult;

/// Files whose presence marks a child workspace as still in active use,
/// even if it is older than `max_age` — mirrors the lock files real tools
/// (git, go, npm) drop in a working tree while holding it open.
const ACTIVE_MARKERS: &[&str] = &[".tako-lock", ".git/index.lock", "go.sum.lock", "package-lock.json.lock"];

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, Default)]
pub struct OrphanedWorkspaceStats {
    pub count: u64,
    pub total_bytes: u64,
}

pub struct CleanupManager {
    workspace_root: PathBuf,
    max_age: Duration,
}

impl CleanupManager {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self::with_max_age(workspace_root, DEFAULT_MAX_AGE)
    }

    pub fn with_max_age(workspace_root: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_age,
        }
    }

    /// Removes every `.../children/<id>` directory older than `max_age`
    /// lacking an active-process marker. Errors removing one candidate are
    /// logged and do not stop the scan.
    pub async fn cleanup_orphaned_workspaces(&self) -> EngineResult<u64> {
        let root = self.workspace_root.clone();
        let max_age = self.max_age;
        let removed = tokio::task::spawn_blocking(move || scan_and_remove(&root, max_age))
            .await
            .map_err(|e| crate::error::EngineError::fatal(format!("cleanup task panicked: {e}")))??;
        Ok(removed)
    }

    /// Removes a specific child workspace by run id, wherever it sits under
    /// `.../children/<run_id>`. Idempotent: a missing child is a success.
    pub async fn cleanup_child_workspace(&self, run_id: &str) -> EngineResult<()> {
        let root = self.workspace_root.clone();
        let run_id = run_id.to_string();
        let removed = tokio::task::spawn_blocking(move || find_child_dirs(&root, &run_id))
            .await
            .map_err(|e| crate::error::EngineError::fatal(format!("cleanup task panicked: {e}")))??;

        for dir in removed {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(path = %dir.display(), "removed child workspace"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove child workspace"),
            }
        }
        Ok(())
    }

    /// Reports `(count, total_bytes)` of workspaces that `cleanup_orphaned_workspaces`
    /// would remove right now, without removing anything.
    pub async fn get_orphaned_workspace_stats(&self) -> EngineResult<OrphanedWorkspaceStats> {
        let root = self.workspace_root.clone();
        let max_age = self.max_age;
        let stats = tokio::task::spawn_blocking(move || stats_for_orphans(&root, max_age))
            .await
            .map_err(|e| crate::error::EngineError::fatal(format!("cleanup task panicked: {e}")))??;
        Ok(stats)
    }
}

/// True if `dir` is exactly a `.../children/<id>` path (the `children`
/// directory's immediate child, not `children` itself or something nested
/// deeper, which belongs to whatever the child workspace itself manages).
fn is_child_workspace_dir(dir: &Path) -> bool {
    dir.parent().map(|p| p.file_name() == Some(std::ffi::OsStr::new("children"))).unwrap_or(false)
}

fn has_active_marker(dir: &Path) -> bool {
    ACTIVE_MARKERS.iter().any(|marker| dir.join(marker).exists())
}

fn older_than(dir: &Path, max_age: Duration) -> bool {
    let Ok(metadata) = std::fs::metadata(dir) else { return false };
    let Ok(modified) = metadata.modified() else { return false };
    SystemTime::now().duration_since(modified).map(|age| age > max_age).unwrap_or(false)
}

fn candidate_child_dirs(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir() && is_child_workspace_dir(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn scan_and_remove(root: &Path, max_age: Duration) -> EngineResult<u64> {
    let mut removed = 0u64;
    for dir in candidate_child_dirs(root) {
        if !older_than(&dir, max_age) || has_active_marker(&dir) {
            continue;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove orphaned workspace"),
        }
    }
    Ok(removed)
}

fn stats_for_orphans(root: &Path, max_age: Duration) -> EngineResult<OrphanedWorkspaceStats> {
    let mut stats = OrphanedWorkspaceStats::default();
    for dir in candidate_child_dirs(root) {
        if !older_than(&dir, max_age) || has_active_marker(&dir) {
            continue;
        }
        stats.count += 1;
        stats.total_bytes += dir_size(&dir);
    }
    Ok(stats)
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn find_child_dirs(root: &Path, run_id: &str) -> EngineResult<Vec<PathBuf>> {
    let target = std::ffi::OsStr::new(run_id);
    Ok(WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir() && is_child_workspace_dir(e.path()) && e.file_name() == target)
        .map(|e| e.path().to_path_buf())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_child(root: &Path, run_id: &str) -> PathBuf {
        let dir = root.join("execrun").join("children").join(run_id);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn backdate(dir: &Path, age: Duration) {
        let past = SystemTime::now() - age;
        let ft = filetime::FileTime::from_system_time(past);
        filetime::set_file_mtime(dir, ft).unwrap();
    }

    #[tokio::test]
    async fn removes_old_orphans_without_markers() {
        let root = tempdir().unwrap();
        let child = make_child(root.path(), "exec-a");
        backdate(&child, Duration::from_secs(48 * 60 * 60));

        let mgr = CleanupManager::with_max_age(root.path(), Duration::from_secs(60 * 60));
        let removed = mgr.cleanup_orphaned_workspaces().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!child.exists());
    }

    #[tokio::test]
    async fn keeps_recent_workspaces() {
        let root = tempdir().unwrap();
        let child = make_child(root.path(), "exec-fresh");

        let mgr = CleanupManager::with_max_age(root.path(), Duration::from_secs(60 * 60));
        let removed = mgr.cleanup_orphaned_workspaces().await.unwrap();
        assert_eq!(removed, 0);
        assert!(child.exists());
    }

    #[tokio::test]
    async fn keeps_workspaces_with_active_marker() {
        let root = tempdir().unwrap();
        let child = make_child(root.path(), "exec-busy");
        std::fs::write(child.join(".tako-lock"), "").unwrap();
        backdate(&child, Duration::from_secs(48 * 60 * 60));

        let mgr = CleanupManager::with_max_age(root.path(), Duration::from_secs(60 * 60));
        let removed = mgr.cleanup_orphaned_workspaces().await.unwrap();
        assert_eq!(removed, 0);
        assert!(child.exists());
    }

    #[tokio::test]
    async fn cleanup_child_workspace_is_idempotent() {
        let root = tempdir().unwrap();
        let mgr = CleanupManager::new(root.path());
        mgr.cleanup_child_workspace("does-not-exist").await.unwrap();

        let child = make_child(root.path(), "exec-b");
        mgr.cleanup_child_workspace("exec-b").await.unwrap();
        assert!(!child.exists());
        mgr.cleanup_child_workspace("exec-b").await.unwrap();
    }

    #[tokio::test]
    async fn stats_report_without_removing() {
        let root = tempdir().unwrap();
        let child = make_child(root.path(), "exec-c");
        std::fs::write(child.join("blob.bin"), vec![0u8; 128]).unwrap();
        backdate(&child, Duration::from_secs(48 * 60 * 60));

        let mgr = CleanupManager::with_max_age(root.path(), Duration::from_secs(60 * 60));
        let stats = mgr.get_orphaned_workspace_stats().await.unwrap();
        assert_eq!(stats.count, 1);
        assert!(stats.total_bytes >= 128);
        assert!(child.exists());
    }
}
