//! Child Runner Factory and Child Workflow Executor (§4.12): lets a running
//! workflow invoke another repository's workflow in its own isolated
//! sub-workspace, sharing the parent's repository cache and lock table.
//!
//! Grounded on `runner.rs`'s own `Runner` construction pattern — a child
//! runner is just another [`Runner`], pointed at `<parent>/children/<id>`
//! instead of the top-level workspace root, wired to the same `cache_dir`
//! and `LockManager` so cache locks are visible across parent and child.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::WorkflowConfig;
use crate::container::ContainerManager;
use crate::error::{EngineError, EngineResult};
use crate::lock::{LockKind, LockManager};
use crate::resource::ResourceManager;
use crate::run_id::RunId;
use crate::runner::{ExecutionContext, Runner, WorkflowResult};
use crate::workspace::WorkspaceManager;

/// Owns everything a freshly-minted child [`Runner`] needs to share with its
/// parent: the cache directory, the lock table, and the resource/container
/// managers. `max_concurrent_repos` bounds how many child executions may be
/// resolving a repository (cache lookup + copy) at once.
#[derive(Clone)]
pub struct ChildRunnerFactory {
    cache_dir: PathBuf,
    lock_manager: LockManager,
    resource_manager: ResourceManager,
    container_manager: Option<Arc<ContainerManager>>,
    repo_semaphore: Arc<tokio::sync::Semaphore>,
}

impl ChildRunnerFactory {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        lock_manager: LockManager,
        resource_manager: ResourceManager,
        container_manager: Option<Arc<ContainerManager>>,
        max_concurrent_repos: usize,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            lock_manager,
            resource_manager,
            container_manager,
            repo_semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent_repos.max(1))),
        }
    }

    /// Constructs a `Runner` rooted at `<parent_workspace>/children`, sharing
    /// this factory's cache dir, lock manager, resource manager, and
    /// container manager. The runner mints its own `RunId` (and workspace
    /// directory under that root) the moment `execute_workflow` is called;
    /// this factory does not pre-create anything, so there is nothing to
    /// unwind if construction itself never fails.
    pub async fn create_child_runner(&self, parent_workspace_root: &Path) -> EngineResult<(Runner, PathBuf)> {
        let children_root = parent_workspace_root.join("children");
        tokio::fs::create_dir_all(&children_root).await.map_err(|e| {
            EngineError::fatal(format!("failed to create children dir {}: {e}", children_root.display()))
        })?;

        let runner = Runner::new(
            children_root.clone(),
            self.cache_dir.clone(),
            self.lock_manager.clone(),
            self.resource_manager.clone(),
            self.container_manager.clone(),
        );

        Ok((runner, children_root))
    }

    /// Removes a child's workspace. Idempotent and best-effort: failures are
    /// logged, never propagated, since cleanup runs on every code path
    /// (success, failure, or cancellation) after the child has already run.
    async fn remove_child_workspace(&self, child_root: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(child_root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %child_root.display(), error = %e, "failed to remove child workspace");
            }
        }
    }

    pub async fn acquire_cache_lock(
        &self,
        cancellation: &CancellationToken,
        run_id: &RunId,
        repo: &str,
        kind: LockKind,
    ) -> EngineResult<crate::lock::Lease> {
        self.lock_manager.acquire_lock(cancellation, run_id, repo, kind, None).await
    }
}

/// Executes another repository's workflow as a child of the current
/// execution, per §4.12. Holds only a factory and the repository-resolution
/// semaphore; it performs no execution itself beyond delegating to the
/// freshly-created child `Runner`.
#[derive(Clone)]
pub struct ChildWorkflowExecutor {
    factory: ChildRunnerFactory,
}

impl ChildWorkflowExecutor {
    pub fn new(factory: ChildRunnerFactory) -> Self {
        Self { factory }
    }

    /// 1. reject malformed identifiers, 2. create a fresh child runner +
    /// workspace, 3. resolve `repo_path` (local dir, or `owner/repo` against
    /// the shared cache), 4. load `tako.yml` and validate the workflow
    /// exists, 5. delegate to the child runner, 6. always clean up the child
    /// workspace regardless of outcome.
    pub async fn execute_workflow(
        &self,
        ctx: &ExecutionContext,
        parent_workspace_root: &Path,
        repo_path: &str,
        workflow_name: &str,
        inputs: HashMap<String, Value>,
        parent_run_id: &RunId,
    ) -> WorkflowResult {
        if let Err(e) = validate_identifier(repo_path).and_then(|_| validate_identifier(workflow_name)) {
            return WorkflowResult {
                run_id: None,
                success: false,
                step_outputs: HashMap::new(),
                error: Some(e.to_string()),
            };
        }

        let _permit = match self.factory.repo_semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return WorkflowResult {
                    run_id: None,
                    success: false,
                    step_outputs: HashMap::new(),
                    error: Some("repository resolution semaphore closed".to_string()),
                }
            }
        };

        let (runner, children_root) = match self.factory.create_child_runner(parent_workspace_root).await {
            Ok(created) => created,
            Err(e) => {
                return WorkflowResult {
                    run_id: None,
                    success: false,
                    step_outputs: HashMap::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        // A scratch id for the repository checkout only — distinct from
        // whatever `RunId` the delegated `Runner::execute_workflow` mints
        // for its own workspace, which is cleaned up separately below.
        let staging_id = RunId::new();
        let staging_dir = children_root.join("repo-staging").join(staging_id.as_str());

        let result = self
            .run_inner(ctx, &runner, &staging_dir, repo_path, workflow_name, inputs, parent_run_id)
            .await;

        self.factory.remove_child_workspace(&staging_dir).await;
        if let Ok(r) = &result {
            if let Some(run_id) = &r.run_id {
                self.factory.remove_child_workspace(&children_root.join(run_id.as_str())).await;
            }
        }

        match result {
            Ok(r) => r,
            Err(e) => WorkflowResult {
                run_id: None,
                success: false,
                step_outputs: HashMap::new(),
                error: Some(e.to_string()),
            },
        }
    }

    async fn run_inner(
        &self,
        ctx: &ExecutionContext,
        runner: &Runner,
        staging_dir: &Path,
        repo_path: &str,
        workflow_name: &str,
        inputs: HashMap<String, Value>,
        parent_run_id: &RunId,
    ) -> EngineResult<WorkflowResult> {
        let resolved = self.resolve_repository(staging_dir, repo_path).await?;

        let config = WorkflowConfig::load(&resolved)?;
        config.workflow(workflow_name)?;

        Ok(runner
            .execute_workflow_as_child(ctx, workflow_name, inputs, &resolved, parent_run_id)
            .await)
    }

    /// A repo path that looks like a local directory is copied as-is; an
    /// `owner/repo[:branch]` reference is looked up in the shared cache.
    /// Either way the result is copied into `staging_dir` with `.git`
    /// excluded, matching the child-workflow repository-copy rule.
    async fn resolve_repository(&self, staging_dir: &Path, repo_path: &str) -> EngineResult<PathBuf> {
        let source = if Path::new(repo_path).is_dir() {
            PathBuf::from(repo_path)
        } else {
            self.resolve_cached_repo(repo_path)?
        };

        tokio::fs::create_dir_all(staging_dir).await?;
        WorkspaceManager::copy_excluding_git(&source, staging_dir).await?;
        Ok(staging_dir.to_path_buf())
    }

    fn resolve_cached_repo(&self, reference: &str) -> EngineResult<PathBuf> {
        let (owner_repo, branch) = reference.split_once(':').unwrap_or((reference, "main"));
        let (owner, name) = owner_repo
            .split_once('/')
            .ok_or_else(|| EngineError::validation(format!("'{reference}' is not a local path or owner/repo[:branch] reference")))?;
        let path = self.factory.cache_dir.join("repos").join(owner).join(name).join(branch);
        if !path.is_dir() {
            return Err(EngineError::configuration(format!(
                "'{reference}' is not present in the repository cache"
            )));
        }
        Ok(path)
    }
}

/// Rejects empty, absolute, `~`-prefixed, or `..`-containing identifiers —
/// the guard named in §4.12 against a child workflow escaping its sandbox
/// via a crafted `repoPath`/`workflowName`.
fn validate_identifier(value: &str) -> EngineResult<()> {
    if value.is_empty() {
        return Err(EngineError::validation("child workflow identifier must not be empty"));
    }
    if value.starts_with('~') || Path::new(value).is_absolute() {
        return Err(EngineError::validation(format!(
            "'{value}' must not be absolute or home-relative"
        )));
    }
    if value.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(EngineError::validation(format!("'{value}' must not contain '..'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn factory(cache_dir: &Path) -> ChildRunnerFactory {
        ChildRunnerFactory::new(cache_dir, LockManager::new(), ResourceManager::default(), None, 4)
    }

    #[test]
    fn rejects_traversal_and_absolute_identifiers() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("/etc/passwd").is_err());
        assert!(validate_identifier("~/secrets").is_err());
        assert!(validate_identifier("../escape").is_err());
        assert!(validate_identifier("org/repo").is_ok());
        assert!(validate_identifier("build").is_ok());
    }

    #[tokio::test]
    async fn create_child_runner_makes_children_dir() {
        let cache = tempdir().unwrap();
        let parent = tempdir().unwrap();
        let f = factory(cache.path());
        let (_runner, children_root) = f.create_child_runner(parent.path()).await.unwrap();
        assert!(children_root.is_dir());
        assert_eq!(children_root, parent.path().join("children"));
    }

    #[tokio::test]
    async fn executes_local_repo_path_end_to_end() {
        let cache = tempdir().unwrap();
        let parent = tempdir().unwrap();
        let repo = tempdir().unwrap();
        std::fs::write(
            repo.path().join("tako.yml"),
            r#"
version: "1"
workflows:
  build:
    steps:
      - id: say
        run: "echo hi"
"#,
        )
        .unwrap();

        let executor = ChildWorkflowExecutor::new(factory(cache.path()));
        let ctx = ExecutionContext::default();
        let result = executor
            .execute_workflow(
                &ctx,
                parent.path(),
                repo.path().to_str().unwrap(),
                "build",
                HashMap::new(),
                &RunId::new(),
            )
            .await;
        assert!(result.success, "{:?}", result.error);

        // no files should survive under `children` once cleanup has run,
        // though empty intermediate directories (e.g. `repo-staging`) may.
        let children_dir = parent.path().join("children");
        let leftover_files = walkdir::WalkDir::new(&children_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .count();
        assert_eq!(leftover_files, 0);
    }

    #[tokio::test]
    async fn unknown_cached_repo_reference_fails_cleanly() {
        let cache = tempdir().unwrap();
        let parent = tempdir().unwrap();
        let executor = ChildWorkflowExecutor::new(factory(cache.path()));
        let ctx = ExecutionContext::default();
        let result = executor
            .execute_workflow(&ctx, parent.path(), "ghost-org/ghost-repo", "build", HashMap::new(), &RunId::new())
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn malformed_identifier_short_circuits_before_touching_disk() {
        let cache = tempdir().unwrap();
        let parent = tempdir().unwrap();
        let executor = ChildWorkflowExecutor::new(factory(cache.path()));
        let ctx = ExecutionContext::default();
        let result = executor
            .execute_workflow(&ctx, parent.path(), "../escape", "build", HashMap::new(), &RunId::new())
            .await;
        assert!(!result.success);
        assert!(result.run_id.is_none());
    }
}
