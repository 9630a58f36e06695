//! Execution State store: persistent per-run state, written atomically.
//!
//! Grounded on the corpus's `storage/index.rs` transaction style (open,
//! mutate, commit) but target format is plain JSON on disk rather than an
//! embedded database table, per §3/§4.1's explicit requirement for a
//! `<workspace>/state/execution.json` file written by temp-file + rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::run_id::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub id: String,
    pub status: StepStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub output: String,
    pub outputs: HashMap<String, String>,
    pub retry_count: u32,
}

impl StepState {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            error: None,
            output: String::new(),
            outputs: HashMap::new(),
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: RunId,
    pub status: RunStatus,
    pub workflow_name: String,
    pub repository: String,
    pub inputs: HashMap<String, serde_json::Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub parent_run_id: Option<RunId>,
    pub child_runs: Vec<RunId>,
    pub steps: HashMap<String, StepState>,
    pub current_step: Option<String>,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
}

/// Summary view returned by `GetSummary`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub workflow_name: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
}

/// Single writer for one run's `state/execution.json`. Constructed bound to
/// one workspace root; every mutation takes the write lock, updates
/// `last_updated`, and persists atomically before releasing.
pub struct ExecutionStateStore {
    path: PathBuf,
    state: RwLock<ExecutionState>,
}

impl ExecutionStateStore {
    fn state_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join("state").join("execution.json")
    }

    /// `StartExecution`: creates a brand-new `Pending`→`Running` state and
    /// persists it for the first time.
    pub async fn start_execution(
        workspace_root: &Path,
        run_id: RunId,
        workflow_name: impl Into<String>,
        repository: impl Into<String>,
        inputs: HashMap<String, serde_json::Value>,
        parent_run_id: Option<RunId>,
    ) -> Result<Self, EngineError> {
        let now = Utc::now();
        let state = ExecutionState {
            run_id,
            status: RunStatus::Running,
            workflow_name: workflow_name.into(),
            repository: repository.into(),
            inputs,
            start_time: now,
            end_time: None,
            error: None,
            parent_run_id,
            child_runs: Vec::new(),
            steps: HashMap::new(),
            current_step: None,
            version: 1,
            last_updated: now,
        };
        let store = Self {
            path: Self::state_path(workspace_root),
            state: RwLock::new(state),
        };
        store.persist().await?;
        Ok(store)
    }

    /// Load a previously-persisted state file (e.g. to check resumability).
    pub async fn load(workspace_root: &Path) -> Result<Self, EngineError> {
        let path = Self::state_path(workspace_root);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| EngineError::fatal(format!("failed to read {}: {e}", path.display())))?;
        let state: ExecutionState = serde_json::from_str(&contents)
            .map_err(|e| EngineError::fatal(format!("corrupted state file {}: {e}", path.display())))?;
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    async fn persist(&self) -> Result<(), EngineError> {
        let state = self.state.read().await;
        let json = serde_json::to_vec_pretty(&*state)
            .map_err(|e| EngineError::fatal(format!("failed to serialize state: {e}")))?;
        drop(state);

        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp_path, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(EngineError::Io(e));
        }
        Ok(())
    }

    async fn mutate<F>(&self, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut ExecutionState),
    {
        {
            let mut state = self.state.write().await;
            f(&mut state);
            state.version += 1;
            state.last_updated = Utc::now();
        }
        self.persist().await
    }

    pub async fn complete_execution(&self) -> Result<(), EngineError> {
        self.mutate(|s| {
            s.status = RunStatus::Completed;
            s.end_time = Some(Utc::now());
            s.current_step = None;
        })
        .await
    }

    pub async fn fail_execution(&self, err: impl Into<String>) -> Result<(), EngineError> {
        let msg = err.into();
        self.mutate(|s| {
            s.status = RunStatus::Failed;
            s.end_time = Some(Utc::now());
            s.error = Some(msg);
        })
        .await
    }

    pub async fn cancel_execution(&self, err: impl Into<String>) -> Result<(), EngineError> {
        let msg = err.into();
        self.mutate(|s| {
            s.status = RunStatus::Cancelled;
            s.end_time = Some(Utc::now());
            s.error = Some(msg);
        })
        .await
    }

    /// `StartStep`: re-entry into an already-`Running` step id is a retry
    /// (§5/§9 resolved Open Question): `retry_count` increments, previous
    /// `end_time`/`error` are cleared.
    pub async fn start_step(&self, step_id: &str) -> Result<(), EngineError> {
        let id = step_id.to_string();
        self.mutate(|s| {
            let is_retry = s
                .steps
                .get(&id)
                .map(|st| st.status == StepStatus::Running || st.status == StepStatus::Failed)
                .unwrap_or(false);
            let entry = s.steps.entry(id.clone()).or_insert_with(|| StepState::pending(id.clone()));
            if is_retry {
                entry.retry_count += 1;
            }
            entry.status = StepStatus::Running;
            entry.start_time = Some(Utc::now());
            entry.end_time = None;
            entry.error = None;
            s.current_step = Some(id);
        })
        .await
    }

    pub async fn complete_step(
        &self,
        step_id: &str,
        output: String,
        outputs: HashMap<String, String>,
    ) -> Result<(), EngineError> {
        let id = step_id.to_string();
        self.mutate(|s| {
            let entry = s.steps.entry(id.clone()).or_insert_with(|| StepState::pending(id.clone()));
            entry.status = StepStatus::Completed;
            entry.end_time = Some(Utc::now());
            entry.output = output;
            entry.outputs = outputs;
        })
        .await
    }

    pub async fn fail_step(&self, step_id: &str, err: impl Into<String>) -> Result<(), EngineError> {
        let id = step_id.to_string();
        let msg = err.into();
        self.mutate(|s| {
            let entry = s.steps.entry(id.clone()).or_insert_with(|| StepState::pending(id.clone()));
            entry.status = StepStatus::Failed;
            entry.end_time = Some(Utc::now());
            entry.error = Some(msg);
        })
        .await
    }

    pub async fn skip_step(&self, step_id: &str, reason: impl Into<String>) -> Result<(), EngineError> {
        let id = step_id.to_string();
        let msg = reason.into();
        self.mutate(|s| {
            let entry = s.steps.entry(id.clone()).or_insert_with(|| StepState::pending(id.clone()));
            entry.status = StepStatus::Skipped;
            entry.end_time = Some(Utc::now());
            entry.error = Some(msg);
        })
        .await
    }

    /// `AddChildRun`: append-only (§3 invariant d).
    pub async fn add_child_run(&self, child: RunId) -> Result<(), EngineError> {
        self.mutate(|s| s.child_runs.push(child)).await
    }

    pub async fn get_status(&self) -> RunStatus {
        self.state.read().await.status
    }

    pub async fn get_failed_steps(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.id.clone())
            .collect()
    }

    pub async fn get_completed_steps(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    /// `IsResumable ⇔ status == failed ∧ GetFailedSteps ≠ ∅`.
    pub async fn is_resumable(&self) -> bool {
        let state = self.state.read().await;
        state.status == RunStatus::Failed
            && state.steps.values().any(|s| s.status == StepStatus::Failed)
    }

    pub async fn get_summary(&self) -> ExecutionSummary {
        let state = self.state.read().await;
        ExecutionSummary {
            run_id: state.run_id.clone(),
            status: state.status,
            workflow_name: state.workflow_name.clone(),
            total_steps: state.steps.len(),
            completed_steps: state
                .steps
                .values()
                .filter(|s| s.status == StepStatus::Completed)
                .count(),
            failed_steps: state
                .steps
                .values()
                .filter(|s| s.status == StepStatus::Failed)
                .count(),
        }
    }

    pub async fn snapshot(&self) -> ExecutionState {
        self.state.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn fresh_store(dir: &Path) -> ExecutionStateStore {
        ExecutionStateStore::start_execution(
            dir,
            RunId::new(),
            "build",
            "org/repo",
            HashMap::new(),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn persists_atomically_and_survives_reload() {
        let dir = tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        store.start_step("s1").await.unwrap();
        store
            .complete_step("s1", "out".into(), HashMap::new())
            .await
            .unwrap();
        store.complete_execution().await.unwrap();

        let reloaded = ExecutionStateStore::load(dir.path()).await.unwrap();
        let snap = reloaded.snapshot().await;
        assert_eq!(snap.status, RunStatus::Completed);
        assert!(snap.end_time.is_some());
        assert!(snap.current_step.is_none());

        let tmp = dir.path().join("state").join("execution.json.tmp");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn end_time_set_on_every_terminal_status() {
        let dir = tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        store.fail_execution("boom").await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.status, RunStatus::Failed);
        assert!(snap.end_time.unwrap() >= snap.start_time);
    }

    #[tokio::test]
    async fn restarting_a_running_step_increments_retry_count() {
        let dir = tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        store.start_step("flaky").await.unwrap();
        store.fail_step("flaky", "network blip").await.unwrap();
        store.start_step("flaky").await.unwrap();

        let snap = store.snapshot().await;
        let step = &snap.steps["flaky"];
        assert_eq!(step.retry_count, 1);
        assert!(step.error.is_none());
        assert!(step.end_time.is_none());
    }

    #[tokio::test]
    async fn is_resumable_only_when_failed_with_failed_steps() {
        let dir = tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        assert!(!store.is_resumable().await);

        store.start_step("s1").await.unwrap();
        store.fail_step("s1", "oops").await.unwrap();
        store.fail_execution("oops").await.unwrap();
        assert!(store.is_resumable().await);
    }

    #[tokio::test]
    async fn child_runs_are_append_only() {
        let dir = tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        let c1 = RunId::new();
        let c2 = RunId::new();
        store.add_child_run(c1.clone()).await.unwrap();
        store.add_child_run(c2.clone()).await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.child_runs, vec![c1, c2]);
    }
}
