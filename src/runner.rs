//! Runner: `ExecuteWorkflow` orchestration (§4.11) — the engine's central
//! entry point, dispatching each step by kind and persisting state around it.
//!
//! Grounded in control flow on the corpus's top-level executor loop (load
//! config → validate → persist → iterate steps → dispatch → persist), with
//! the subprocess/env-injection pattern adapted from the same file's shell
//! step handling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::child::{ChildRunnerFactory, ChildWorkflowExecutor};
use crate::config::{InputType, ProducesSpec, Step, WorkflowConfig, WorkflowSpec};
use crate::container::ContainerManager;
use crate::error::{EngineError, EngineResult};
use crate::events::Event;
use crate::lock::{LockKind, LockManager};
use crate::registry::{self, Credentials};
use crate::resource::ResourceManager;
use crate::run_id::RunId;
use crate::state::{ExecutionStateStore, RunStatus};
use crate::subscription::SubscriptionEvaluator;
use crate::template::{self, ContextBuilder};
use crate::workspace::{Workspace, WorkspaceManager};

/// How many fan-out children may be resolving/executing concurrently,
/// bounded at the [`ChildRunnerFactory`] semaphore (§5: `maxConcurrentRepos`).
const DEFAULT_MAX_CONCURRENT_REPOS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub cancellation: CancellationToken,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowResult {
    pub run_id: Option<RunId>,
    pub success: bool,
    pub step_outputs: HashMap<String, HashMap<String, String>>,
    pub error: Option<String>,
}

impl WorkflowResult {
    fn failure(run_id: Option<RunId>, err: impl std::fmt::Display) -> Self {
        Self {
            run_id,
            success: false,
            step_outputs: HashMap::new(),
            error: Some(err.to_string()),
        }
    }
}

/// Shared, process-wide collaborators a [`Runner`] is constructed with; the
/// same `lock_manager`/`cache_dir` are reused by every child runner the
/// factory in [`crate::child`] spawns.
pub struct Runner {
    pub workspace_root: PathBuf,
    pub cache_dir: PathBuf,
    pub workspace_manager: WorkspaceManager,
    pub lock_manager: LockManager,
    pub resource_manager: ResourceManager,
    pub container_manager: Option<Arc<ContainerManager>>,
    pub credentials: Option<Credentials>,
    child_factory: ChildRunnerFactory,
}

impl Runner {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        lock_manager: LockManager,
        resource_manager: ResourceManager,
        container_manager: Option<Arc<ContainerManager>>,
    ) -> Self {
        Self::with_max_concurrent_repos(
            workspace_root,
            cache_dir,
            lock_manager,
            resource_manager,
            container_manager,
            DEFAULT_MAX_CONCURRENT_REPOS,
        )
    }

    /// Like [`Self::new`], but with an explicit bound on how many fan-out
    /// children may be resolving a repository and executing at once.
    pub fn with_max_concurrent_repos(
        workspace_root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        lock_manager: LockManager,
        resource_manager: ResourceManager,
        container_manager: Option<Arc<ContainerManager>>,
        max_concurrent_repos: usize,
    ) -> Self {
        let workspace_root = workspace_root.into();
        let cache_dir = cache_dir.into();
        let child_factory = ChildRunnerFactory::new(
            cache_dir.clone(),
            lock_manager.clone(),
            resource_manager.clone(),
            container_manager.clone(),
            max_concurrent_repos,
        );
        let credentials = default_docker_config_path()
            .and_then(|path| registry::load_docker_config(&path).ok())
            .and_then(|mut creds| creds.remove("docker.io"));
        Self {
            workspace_manager: WorkspaceManager::new(workspace_root.clone()),
            workspace_root,
            cache_dir,
            lock_manager,
            resource_manager,
            container_manager,
            credentials,
            child_factory,
        }
    }

    /// §4.11. Never panics on user-induced error; always returns a
    /// consistent `WorkflowResult` whose `success` matches whether `error`
    /// is set.
    pub async fn execute_workflow(
        &self,
        ctx: &ExecutionContext,
        workflow_name: &str,
        inputs: HashMap<String, Value>,
        repo_path: &Path,
    ) -> WorkflowResult {
        let run_id = RunId::new();
        match self
            .execute_workflow_inner(ctx, &run_id, workflow_name, inputs, repo_path, None)
            .await
        {
            Ok(result) => result,
            Err(e) => WorkflowResult::failure(Some(run_id), e),
        }
    }

    /// Entered only by [`Self::dispatch_fan_out`]: identical to
    /// [`Self::execute_workflow`] except the minted run is recorded with
    /// `parent_run_id` set, populating the run tree (§3 invariant d).
    pub(crate) async fn execute_workflow_as_child(
        &self,
        ctx: &ExecutionContext,
        workflow_name: &str,
        inputs: HashMap<String, Value>,
        repo_path: &Path,
        parent_run_id: &RunId,
    ) -> WorkflowResult {
        let run_id = RunId::new();
        match self
            .execute_workflow_inner(ctx, &run_id, workflow_name, inputs, repo_path, Some(parent_run_id.clone()))
            .await
        {
            Ok(result) => result,
            Err(e) => WorkflowResult::failure(Some(run_id), e),
        }
    }

    async fn execute_workflow_inner(
        &self,
        ctx: &ExecutionContext,
        run_id: &RunId,
        workflow_name: &str,
        inputs: HashMap<String, Value>,
        repo_path: &Path,
        parent_run_id: Option<RunId>,
    ) -> EngineResult<WorkflowResult> {
        let config = WorkflowConfig::load(repo_path)?;
        let workflow = config.workflow(workflow_name)?;
        let inputs = validate_inputs(workflow, inputs)?;

        let workspace = self.workspace_manager.create_workspace(run_id).await?;
        let isolated_repo_path = self.workspace_manager.prepare_repository(&workspace, repo_path, false).await?;
        let repository = repo_path.display().to_string();
        let state = ExecutionStateStore::start_execution(
            workspace.root(),
            run_id.clone(),
            workflow_name,
            repository.clone(),
            inputs.clone(),
            parent_run_id,
        )
        .await?;

        info!(run_id = %run_id, workflow = workflow_name, "execution started");

        let mut step_outputs: HashMap<String, HashMap<String, String>> = HashMap::new();

        for step in &workflow.steps {
            if ctx.cancellation.is_cancelled() {
                state.cancel_execution("context cancelled before step").await?;
                return Ok(WorkflowResult {
                    run_id: Some(run_id.clone()),
                    success: false,
                    step_outputs,
                    error: Some("run cancelled".to_string()),
                });
            }

            state.start_step(step.id()).await?;

            let dispatch = self
                .dispatch_step(ctx, run_id, &workspace, step, &inputs, &step_outputs, &isolated_repo_path)
                .await;

            match dispatch {
                Ok(result) => {
                    state
                        .complete_step(step.id(), result.output.clone(), result.outputs.clone())
                        .await?;
                    for child_id in &result.child_run_ids {
                        state.add_child_run(child_id.clone()).await?;
                    }
                    step_outputs.insert(step.id().to_string(), result.outputs);
                }
                Err(e) => {
                    warn!(run_id = %run_id, step = step.id(), error = %e, "step failed");
                    state.fail_step(step.id(), e.to_string()).await?;
                    if matches!(e, EngineError::Cancelled(_)) {
                        state.cancel_execution(e.to_string()).await?;
                    } else {
                        state.fail_execution(e.to_string()).await?;
                    }
                    return Ok(WorkflowResult {
                        run_id: Some(run_id.clone()),
                        success: false,
                        step_outputs,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        state.complete_execution().await?;
        info!(run_id = %run_id, workflow = workflow_name, "execution completed");
        Ok(WorkflowResult {
            run_id: Some(run_id.clone()),
            success: true,
            step_outputs,
            error: None,
        })
    }

    async fn dispatch_step(
        &self,
        ctx: &ExecutionContext,
        run_id: &RunId,
        workspace: &Workspace,
        step: &Step,
        inputs: &HashMap<String, Value>,
        prior_outputs: &HashMap<String, HashMap<String, String>>,
        repo_path: &Path,
    ) -> EngineResult<StepDispatchResult> {
        let template_ctx = build_template_context(inputs, prior_outputs);

        match step {
            Step::Shell(shell) => {
                let command = template::expand(&shell.run, &template_ctx)
                    .map_err(|e| EngineError::validation(e.to_string()))?;

                if ctx.dry_run {
                    return Ok(StepDispatchResult {
                        output: format!("[dry-run] {command}"),
                        outputs: HashMap::new(),
                        child_run_ids: Vec::new(),
                    });
                }

                let env = env_injection(run_id, step.id(), workspace, inputs, &shell.env);
                let (stdout, stderr, status) = run_shell(&command, &env, repo_path, &ctx.cancellation).await?;
                if !status.success() {
                    return Err(EngineError::runtime(format!(
                        "shell step '{}' exited with {:?}: {}",
                        step.id(),
                        status.code(),
                        stderr.trim()
                    )));
                }
                let outputs = capture_outputs(shell.produces.as_ref(), &stdout, &stderr)?;
                Ok(StepDispatchResult { output: stdout, outputs, child_run_ids: Vec::new() })
            }
            Step::Container(container) => {
                if let Some(resources) = &container.resources {
                    self.resource_manager
                        .validate_request(&repo_path.display().to_string(), resources.cpu.as_deref(), resources.memory.as_deref())
                        .map_err(|e| EngineError::resource(e.to_string()))?;
                }

                if ctx.dry_run {
                    let command = container.run.clone().unwrap_or_default();
                    return Ok(StepDispatchResult {
                        output: format!("[dry-run] {command}"),
                        outputs: HashMap::new(),
                        child_run_ids: Vec::new(),
                    });
                }
                let manager = self
                    .container_manager
                    .as_ref()
                    .ok_or_else(|| EngineError::configuration("no container runtime configured"))?;

                let mut container = container.clone();
                if let Some(run) = &container.run {
                    container.run = Some(
                        template::expand(run, &template_ctx).map_err(|e| EngineError::validation(e.to_string()))?,
                    );
                }
                for (k, v) in env_injection(run_id, step.id(), workspace, inputs, &HashMap::new()) {
                    container.env.entry(k).or_insert(v);
                }

                let workspace_host_path = workspace.repos_dir().display().to_string();
                let result = manager
                    .execute_step(run_id.as_str(), &container, &workspace_host_path, self.credentials.as_ref(), &ctx.cancellation)
                    .await?;
                if result.exit_code != 0 {
                    return Err(EngineError::runtime(format!(
                        "container step '{}' exited with {}: {}",
                        step.id(),
                        result.exit_code,
                        result.stderr.trim()
                    )));
                }
                let outputs = capture_outputs(container.produces.as_ref(), &result.stdout, &result.stderr)?;
                Ok(StepDispatchResult {
                    output: result.stdout,
                    outputs,
                    child_run_ids: Vec::new(),
                })
            }
            Step::BuiltIn(builtin) => match builtin.uses.as_str() {
                "tako/fan-out@v1" => self.dispatch_fan_out(ctx, run_id, workspace, builtin, repo_path).await,
                other => Err(EngineError::validation(format!("unknown built-in step '{other}'"))),
            },
        }
    }

    /// `tako/fan-out@v1`: emits an event, evaluates every cached repository's
    /// subscriptions against it, and invokes a child workflow per match
    /// through [`ChildWorkflowExecutor`] (§4.12), bounded by the runner's
    /// configured `max_concurrent_repos` and recorded against `run_id` as
    /// the parent of each child run.
    async fn dispatch_fan_out(
        &self,
        ctx: &ExecutionContext,
        run_id: &RunId,
        workspace: &Workspace,
        builtin: &crate::config::BuiltInStep,
        repo_path: &Path,
    ) -> EngineResult<StepDispatchResult> {
        let event_type = builtin
            .with
            .get("event_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::validation("fan-out step missing 'event_type'"))?;
        let schema_version = builtin
            .with
            .get("schema_version")
            .and_then(|v| v.as_str())
            .unwrap_or("1.0.0");
        let payload = builtin.with.get("payload").cloned().unwrap_or(Value::Object(Default::default()));

        let artifact_ref = builtin
            .with
            .get("artifact")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| repo_path.display().to_string());

        let event = Event::new(event_type, schema_version, payload.clone(), artifact_ref.clone());

        let evaluator = SubscriptionEvaluator::new(64);
        let matches = self.discover_subscribers(ctx, run_id, &artifact_ref, &event, &evaluator).await?;
        let triggered = matches.len();

        let executor = ChildWorkflowExecutor::new(self.child_factory.clone());
        let workspace_root = workspace.root().to_path_buf();
        let mut set = JoinSet::new();
        for (subscriber_repo, spec) in matches {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            let child_inputs = SubscriptionEvaluator::process_event_payload(&payload, &spec)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            let executor = executor.clone();
            let ctx = ctx.clone();
            let workspace_root = workspace_root.clone();
            let parent_run_id = run_id.clone();
            let repo_display = subscriber_repo.display().to_string();
            let workflow_name = spec.workflow.clone();
            set.spawn(async move {
                let result = executor
                    .execute_workflow(&ctx, &workspace_root, &repo_display, &workflow_name, child_inputs, &parent_run_id)
                    .await;
                (repo_display, workflow_name, result)
            });
        }

        let mut child_run_ids = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((repo_display, workflow_name, result)) => {
                    if let Some(child_id) = &result.run_id {
                        child_run_ids.push(child_id.clone());
                    }
                    if !result.success {
                        warn!(
                            repo = %repo_display,
                            workflow = %workflow_name,
                            error = ?result.error,
                            "fan-out child workflow failed"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "fan-out child task did not complete"),
            }
        }

        let mut outputs = HashMap::new();
        outputs.insert("event_emitted".to_string(), event.schema.clone());
        outputs.insert("triggered_workflows".to_string(), triggered.to_string());
        outputs.insert(
            "child_run_ids".to_string(),
            child_run_ids.iter().map(|id| id.as_str().to_string()).collect::<Vec<_>>().join(","),
        );

        Ok(StepDispatchResult {
            output: format!("fan-out emitted {} triggering {} workflows", event.schema, triggered),
            outputs,
            child_run_ids,
        })
    }

    /// Walks `<cache_dir>/repos/*/*/*/tako.yml`, taking a reader lease on
    /// each `(repo, kind)` candidate before inspecting its `tako.yml` so a
    /// concurrent writer populating that subscriber's config can't be read
    /// mid-write, parsing each and keeping subscriptions whose `artifact`
    /// matches and whose evaluator-level checks (type/schema/filter) pass
    /// against `event`.
    async fn discover_subscribers(
        &self,
        ctx: &ExecutionContext,
        run_id: &RunId,
        artifact_ref: &str,
        event: &Event,
        evaluator: &SubscriptionEvaluator,
    ) -> EngineResult<Vec<(PathBuf, crate::config::SubscriptionSpec)>> {
        let repos_root = self.cache_dir.join("repos");
        let mut matches = Vec::new();
        if !repos_root.is_dir() {
            return Ok(matches);
        }
        for owner_entry in std::fs::read_dir(&repos_root).into_iter().flatten().flatten() {
            let owner = owner_entry.file_name().to_string_lossy().to_string();
            for name_entry in std::fs::read_dir(owner_entry.path()).into_iter().flatten().flatten() {
                let name = name_entry.file_name().to_string_lossy().to_string();
                for branch_entry in std::fs::read_dir(name_entry.path()).into_iter().flatten().flatten() {
                    let branch = branch_entry.file_name().to_string_lossy().to_string();
                    let repo_dir = branch_entry.path();
                    let repo_key = format!("{owner}/{name}:{branch}");

                    let lease = self.acquire_repo_lock(&ctx.cancellation, run_id, &repo_key, LockKind::Read).await?;
                    let config_path = repo_dir.join("tako.yml");
                    let parsed = std::fs::read_to_string(&config_path)
                        .ok()
                        .and_then(|contents| WorkflowConfig::from_yaml_str(&contents).ok());
                    lease.release().await;

                    let Some(config) = parsed else { continue };
                    for sub in &config.subscriptions {
                        if sub.artifact != artifact_ref {
                            continue;
                        }
                        match evaluator.evaluate_subscription(sub, event) {
                            Ok(true) => matches.push((repo_dir.clone(), sub.clone())),
                            Ok(false) => {}
                            Err(e) => warn!(error = %e, artifact = %artifact_ref, "subscription evaluation failed"),
                        }
                    }
                }
            }
        }
        Ok(matches)
    }

    /// Resolves `owner/repo[:branch]` (default `main`) against the shared
    /// cache; missing returns a configuration error.
    pub fn resolve_cached_repo(&self, reference: &str) -> EngineResult<PathBuf> {
        let (owner_repo, branch) = reference.split_once(':').unwrap_or((reference, "main"));
        let (owner, name) = owner_repo
            .split_once('/')
            .ok_or_else(|| EngineError::validation(format!("'{reference}' is not in owner/repo[:branch] form")))?;
        let path = self.cache_dir.join("repos").join(owner).join(name).join(branch);
        if !path.is_dir() {
            return Err(EngineError::configuration(format!("'{reference}' is not present in the repository cache")));
        }
        Ok(path)
    }

    pub async fn acquire_repo_lock(
        &self,
        cancellation: &CancellationToken,
        run_id: &RunId,
        repo: &str,
        kind: LockKind,
    ) -> EngineResult<crate::lock::Lease> {
        self.lock_manager.acquire_lock(cancellation, run_id, repo, kind, None).await
    }
}

struct StepDispatchResult {
    output: String,
    outputs: HashMap<String, String>,
    child_run_ids: Vec<RunId>,
}

/// Default location `docker login`/`podman login` write credentials to; read
/// non-fatally at `Runner` construction so a missing or absent-entry config
/// never blocks startup (see [`Runner::with_max_concurrent_repos`]).
fn default_docker_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

fn build_template_context(
    inputs: &HashMap<String, Value>,
    prior_outputs: &HashMap<String, HashMap<String, String>>,
) -> crate::template::TemplateContext {
    let mut builder = ContextBuilder::new().with_inputs(inputs);
    for (step_id, outputs) in prior_outputs {
        builder = builder.with_step_outputs(step_id, outputs);
    }
    builder.build()
}

fn validate_inputs(spec: &WorkflowSpec, mut inputs: HashMap<String, Value>) -> EngineResult<HashMap<String, Value>> {
    for (name, input_spec) in &spec.inputs {
        match inputs.get(name) {
            Some(value) => {
                match input_spec.input_type {
                    InputType::Number if !value.is_number() => {
                        return Err(EngineError::validation(format!("input '{name}' must be a number")))
                    }
                    InputType::String if !value.is_string() => {
                        return Err(EngineError::validation(format!("input '{name}' must be a string")))
                    }
                    _ => {}
                }
                if let Some(validation) = &input_spec.validation {
                    if !validation.enum_values.is_empty() {
                        let as_str = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                        if !validation.enum_values.iter().any(|v| v == &as_str) {
                            return Err(EngineError::validation(format!(
                                "input '{name}' must be one of {:?}, got '{as_str}'",
                                validation.enum_values
                            )));
                        }
                    }
                }
            }
            None => {
                if let Some(default) = &input_spec.default {
                    inputs.insert(name.clone(), default.clone());
                } else if input_spec.required {
                    return Err(EngineError::validation(format!("missing required input '{name}'")));
                }
            }
        }
    }
    Ok(inputs)
}

fn env_injection(
    run_id: &RunId,
    step_id: &str,
    workspace: &Workspace,
    inputs: &HashMap<String, Value>,
    extra: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = extra.clone();
    env.insert("TAKO_RUN_ID".to_string(), run_id.as_str().to_string());
    env.insert("TAKO_STEP_ID".to_string(), step_id.to_string());
    env.insert("TAKO_WORKSPACE".to_string(), workspace.root().display().to_string());
    for (name, value) in inputs {
        let key = format!("TAKO_INPUT_{}", name.to_uppercase());
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        env.insert(key, value);
    }
    env
}

/// Runs `command` under `sh -c`, killing it (SIGKILL, via tokio's
/// `kill_on_drop`) the instant `cancellation` fires — the container path
/// gets a graceful SIGTERM-then-grace window (see `container::runtime`)
/// because stopping a container cleanly matters more than stopping a shell
/// subprocess, which is typically short-lived.
async fn run_shell(
    command: &str,
    env: &HashMap<String, String>,
    cwd: &Path,
    cancellation: &CancellationToken,
) -> EngineResult<(String, String, std::process::ExitStatus)> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .kill_on_drop(true)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| EngineError::runtime(format!("failed to spawn shell: {e}")))?;
    let wait_future = child.wait_with_output();
    tokio::pin!(wait_future);

    tokio::select! {
        output = &mut wait_future => {
            let output = output.map_err(|e| EngineError::runtime(format!("shell step failed: {e}")))?;
            Ok((
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
                output.status,
            ))
        }
        _ = cancellation.cancelled() => {
            Err(EngineError::Cancelled(format!("shell command '{command}' cancelled")))
        }
    }
}

/// `produces.outputs` per §4.11: `from_stdout`/`from_stderr` trim; anything
/// else is a regex applied to stdout, taking capture group 1 or the whole
/// match if there is no group.
fn capture_outputs(produces: Option<&ProducesSpec>, stdout: &str, stderr: &str) -> EngineResult<HashMap<String, String>> {
    let mut outputs = HashMap::new();
    let Some(produces) = produces else { return Ok(outputs) };
    for (name, rule) in &produces.outputs {
        let value = match rule.as_str() {
            "from_stdout" => stdout.trim().to_string(),
            "from_stderr" => stderr.trim().to_string(),
            pattern => {
                let re = Regex::new(pattern)
                    .map_err(|e| EngineError::validation(format!("output rule '{pattern}' is not a valid regex: {e}")))?;
                match re.captures(stdout) {
                    Some(caps) => caps
                        .get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                    None => String::new(),
                }
            }
        };
        outputs.insert(name.clone(), value);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(dir: &Path, yaml: &str) {
        std::fs::write(dir.join("tako.yml"), yaml).unwrap();
    }

    fn runner(workspace_root: &Path, cache_dir: &Path) -> Runner {
        Runner::new(workspace_root, cache_dir, LockManager::new(), ResourceManager::default(), None)
    }

    #[tokio::test]
    async fn dry_run_echoes_and_never_executes() {
        let repo = tempdir().unwrap();
        write_config(
            repo.path(),
            r#"
version: "1"
workflows:
  build:
    steps:
      - id: say
        run: "echo ${{ .inputs.msg }}"
"#,
        );
        let workspace_root = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let r = runner(workspace_root.path(), cache_dir.path());
        let mut inputs = HashMap::new();
        inputs.insert("msg".to_string(), Value::String("hello".to_string()));
        let ctx = ExecutionContext {
            cancellation: CancellationToken::new(),
            dry_run: true,
        };
        let result = r.execute_workflow(&ctx, "build", inputs, repo.path()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.step_outputs.get("say"),
            None,
        );
    }

    #[tokio::test]
    async fn shell_failure_fails_the_run() {
        let repo = tempdir().unwrap();
        write_config(
            repo.path(),
            r#"
version: "1"
workflows:
  build:
    steps:
      - id: boom
        run: "exit 7"
"#,
        );
        let workspace_root = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let r = runner(workspace_root.path(), cache_dir.path());
        let ctx = ExecutionContext::default();
        let result = r.execute_workflow(&ctx, "build", HashMap::new(), repo.path()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn produces_from_stdout_is_captured() {
        let repo = tempdir().unwrap();
        write_config(
            repo.path(),
            r#"
version: "1"
workflows:
  build:
    steps:
      - id: version
        run: "echo 1.2.3"
        produces:
          outputs:
            version: from_stdout
"#,
        );
        let workspace_root = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let r = runner(workspace_root.path(), cache_dir.path());
        let ctx = ExecutionContext::default();
        let result = r.execute_workflow(&ctx, "build", HashMap::new(), repo.path()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.step_outputs["version"]["version"], "1.2.3");
    }

    #[tokio::test]
    async fn missing_required_input_fails_fast() {
        let repo = tempdir().unwrap();
        write_config(
            repo.path(),
            r#"
version: "1"
workflows:
  build:
    inputs:
      msg:
        type: string
        required: true
    steps:
      - id: say
        run: "echo ${{ .inputs.msg }}"
"#,
        );
        let workspace_root = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let r = runner(workspace_root.path(), cache_dir.path());
        let ctx = ExecutionContext::default();
        let result = r.execute_workflow(&ctx, "build", HashMap::new(), repo.path()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("msg"));
    }

    #[tokio::test]
    async fn container_step_over_memory_quota_fails_before_execution() {
        use crate::resource::Quota;

        let repo = tempdir().unwrap();
        write_config(
            repo.path(),
            r#"
version: "1"
workflows:
  build:
    steps:
      - id: compile
        image: alpine
        run: "echo hi"
        resources:
          memory: "2Gi"
"#,
        );
        let workspace_root = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let resource_manager = ResourceManager::new(Quota {
            cpu: None,
            memory: Some(1024 * 1024 * 1024),
        });
        let r = Runner::new(workspace_root.path(), cache_dir.path(), LockManager::new(), resource_manager, None);
        let ctx = ExecutionContext::default();
        let result = r.execute_workflow(&ctx, "build", HashMap::new(), repo.path()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("quota"));
    }

    #[tokio::test]
    async fn unknown_workflow_is_a_configuration_failure() {
        let repo = tempdir().unwrap();
        write_config(repo.path(), "version: \"1\"\nworkflows: {}\n");
        let workspace_root = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let r = runner(workspace_root.path(), cache_dir.path());
        let ctx = ExecutionContext::default();
        let result = r.execute_workflow(&ctx, "nope", HashMap::new(), repo.path()).await;
        assert!(!result.success);
    }
}
