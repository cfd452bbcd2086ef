pub mod json_file;
pub mod migration;
pub mod sqlite;

use crate::config::{AppConfig, StoreBackendPreference};
use crate::errors::{AppError, AppResult};
use crate::models::{
    now_utc, ListRunsFilter, NewRun, NewWorkspace, Run, RunEvent, RunStatus, RunStream, ThreadMeta,
    ThreadMetaPatch, Workspace, WorkspacePatch, WorkspaceStatus, WorkspaceThread,
};
use std::sync::Arc;
use uuid::Uuid;

pub use json_file::JsonFileStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    JsonFile,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::JsonFile => "json",
        }
    }
}

/// Persistence contract shared by both backends. Every implementation must
/// return identical results for the same sequence of calls.
pub trait Store: Send + Sync {
    fn backend(&self) -> StoreBackend;

    fn list_workspaces(&self) -> AppResult<Vec<Workspace>>;
    fn get_workspace(&self, workspace_id: &str) -> AppResult<Option<Workspace>>;
    fn create_workspace(&self, input: NewWorkspace) -> AppResult<Workspace>;
    fn update_workspace(&self, workspace_id: &str, patch: WorkspacePatch) -> AppResult<Option<Workspace>>;
    fn set_workspace_status(&self, workspace_id: &str, status: WorkspaceStatus) -> AppResult<()>;
    /// Removes the workspace together with its runs, their events and its thread links.
    fn delete_workspace(&self, workspace_id: &str) -> AppResult<bool>;

    fn create_run(&self, input: NewRun) -> AppResult<Run>;
    fn get_run(&self, run_id: &str) -> AppResult<Option<Run>>;
    fn list_runs(&self, filter: &ListRunsFilter) -> AppResult<Vec<Run>>;
    fn finish_run(&self, run_id: &str, exit_code: Option<i32>, last_snippet: Option<&str>) -> AppResult<()>;
    /// Assigns the next gap-free sequence number for `run_id` under the store's lock.
    fn append_run_event(&self, run_id: &str, stream: RunStream, chunk: &str) -> AppResult<RunEvent>;
    /// `append_run_event` plus the run's snippet, written as one change.
    fn append_run_output(&self, run_id: &str, stream: RunStream, chunk: &str, snippet: &str) -> AppResult<RunEvent>;
    fn list_run_events(&self, run_id: &str, after_seq: Option<i64>) -> AppResult<Vec<RunEvent>>;
    /// Marks every `running` run as done with the stale exit code. Called once at boot.
    fn mark_stale_runs(&self) -> AppResult<u64>;

    fn get_thread_meta(&self, thread_id: &str) -> AppResult<Option<ThreadMeta>>;
    fn upsert_thread_meta(&self, thread_id: &str, patch: ThreadMetaPatch) -> AppResult<ThreadMeta>;
    fn list_thread_meta(&self) -> AppResult<Vec<ThreadMeta>>;

    fn link_workspace_thread(&self, workspace_id: &str, thread_id: &str) -> AppResult<WorkspaceThread>;
    fn unlink_workspace_thread(&self, workspace_id: &str, thread_id: &str) -> AppResult<bool>;
    fn list_workspace_threads(&self, workspace_id: &str) -> AppResult<Vec<WorkspaceThread>>;
}

pub fn open_store(config: &AppConfig) -> AppResult<Arc<dyn Store>> {
    match config.store {
        StoreBackendPreference::Sqlite => Ok(Arc::new(open_sqlite(config)?)),
        StoreBackendPreference::Json => Ok(Arc::new(JsonFileStore::open(&config.json_state_path())?)),
        StoreBackendPreference::Auto => match open_sqlite(config) {
            Ok(store) => Ok(Arc::new(store)),
            Err(error) => {
                tracing::warn!(error = %error, "sqlite store unavailable, falling back to json file store");
                Ok(Arc::new(JsonFileStore::open(&config.json_state_path())?))
            }
        },
    }
}

fn open_sqlite(config: &AppConfig) -> AppResult<SqliteStore> {
    let store = SqliteStore::open(&config.sqlite_path())?;
    let legacy_path = config.json_state_path();
    if legacy_path.exists() {
        match store.import_json_state_if_empty(&legacy_path) {
            Ok(true) => tracing::info!(path = %legacy_path.display(), "imported json state into sqlite store"),
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(error = %error, path = %legacy_path.display(), "failed to import json state")
            }
        }
    }
    Ok(store)
}

pub(crate) fn build_workspace(input: NewWorkspace) -> AppResult<Workspace> {
    let repo_path = input.repo_path.trim().to_string();
    if repo_path.is_empty() {
        return Err(AppError::Validation("Workspace repo_path cannot be empty".to_string()));
    }
    let title = match input.title.trim() {
        "" => std::path::Path::new(&repo_path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(repo_path.as_str())
            .to_string(),
        title => title.to_string(),
    };
    let now = now_utc();
    Ok(Workspace {
        id: Uuid::new_v4().to_string(),
        title,
        repo_path,
        status: WorkspaceStatus::Idle,
        notify_policy: input.notify_policy.unwrap_or_default(),
        default_thread_id: input.default_thread_id,
        test_command_override: input.test_command_override,
        created_at: now,
        updated_at: now,
    })
}

pub(crate) fn patch_workspace(workspace: &mut Workspace, patch: WorkspacePatch) -> AppResult<()> {
    if patch.repo_path.as_deref().is_some_and(|path| path.trim().is_empty()) {
        return Err(AppError::Validation("Workspace repo_path cannot be empty".to_string()));
    }
    if patch.title.as_deref().is_some_and(|title| title.trim().is_empty()) {
        return Err(AppError::Validation("Workspace title cannot be empty".to_string()));
    }
    patch.apply(workspace);
    workspace.updated_at = now_utc();
    Ok(())
}

pub(crate) fn build_run(input: NewRun) -> Run {
    let now = now_utc();
    Run {
        id: Uuid::new_v4().to_string(),
        workspace_id: input.workspace_id,
        run_type: input.run_type,
        command: input.command,
        cwd: input.cwd,
        status: RunStatus::Running,
        exit_code: None,
        created_at: now,
        updated_at: now,
        last_snippet: None,
    }
}

pub(crate) fn newer_first<T, K: Ord>(items: &mut Vec<T>, key: impl Fn(&T) -> K) {
    // Reverse first so that ties keep newest-inserted first after the stable sort.
    items.reverse();
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

pub(crate) fn apply_limit<T>(items: &mut Vec<T>, limit: Option<usize>) {
    if let Some(limit) = limit {
        items.truncate(limit);
    }
}
