use super::migration::{migrate_legacy_state, STATE_VERSION};
use super::{apply_limit, build_run, build_workspace, newer_first, patch_workspace, Store, StoreBackend};
use crate::errors::{AppError, AppResult};
use crate::models::{
    now_utc, ListRunsFilter, NewRun, NewWorkspace, Run, RunEvent, RunStatus, RunStream, ThreadMeta,
    ThreadMetaPatch, Workspace, WorkspacePatch, WorkspaceStatus, WorkspaceThread, STALE_RUN_EXIT_CODE,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub run_events: Vec<RunEvent>,
    #[serde(default)]
    pub thread_meta: Vec<ThreadMeta>,
    #[serde(default)]
    pub workspace_threads: Vec<WorkspaceThread>,
}

impl PersistedState {
    fn next_seq(&self, run_id: &str) -> i64 {
        self.run_events
            .iter()
            .filter(|event| event.run_id == run_id)
            .map(|event| event.seq)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn push_event(&mut self, run_id: &str, stream: RunStream, chunk: &str) -> AppResult<RunEvent> {
        if !self.runs.iter().any(|run| run.id == run_id) {
            return Err(AppError::NotFound(format!("Run {} not found", run_id)));
        }
        let event = RunEvent {
            run_id: run_id.to_string(),
            seq: self.next_seq(run_id),
            ts: now_utc(),
            stream,
            chunk: chunk.to_string(),
        };
        self.run_events.push(event.clone());
        Ok(event)
    }

    fn run_mut(&mut self, run_id: &str) -> AppResult<&mut Run> {
        self.runs
            .iter_mut()
            .find(|run| run.id == run_id)
            .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))
    }

    fn workspace_mut(&mut self, workspace_id: &str) -> AppResult<&mut Workspace> {
        self.workspaces
            .iter_mut()
            .find(|workspace| workspace.id == workspace_id)
            .ok_or_else(|| AppError::NotFound(format!("Workspace {} not found", workspace_id)))
    }
}

/// Reads a state file, upgrading legacy shapes. The flag reports whether a
/// migration rewrote anything.
pub fn load_state(path: &Path) -> AppResult<(PersistedState, bool)> {
    if !path.exists() {
        return Ok((
            PersistedState {
                version: STATE_VERSION,
                ..PersistedState::default()
            },
            false,
        ));
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok((
            PersistedState {
                version: STATE_VERSION,
                ..PersistedState::default()
            },
            false,
        ));
    }
    let mut value: serde_json::Value = serde_json::from_str(&raw)?;
    let migrated = migrate_legacy_state(&mut value);
    let state: PersistedState = serde_json::from_value(value)?;
    Ok((state, migrated))
}

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl JsonFileStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let (state, migrated) = load_state(path)?;
        let store = Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        };
        if migrated {
            let backup = path.with_extension("json.legacy");
            if !backup.exists() {
                fs::copy(path, &backup)?;
            }
            let state = store.lock()?;
            store.persist(&state)?;
            tracing::info!(path = %path.display(), "migrated legacy state file");
        }
        Ok(store)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, PersistedState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("json store mutex poisoned".to_string()))
    }

    fn persist(&self, state: &PersistedState) -> AppResult<()> {
        let encoded = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // Changes land in memory only once they are on disk.
    fn mutate<T>(&self, apply: impl FnOnce(&mut PersistedState) -> AppResult<T>) -> AppResult<T> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        let output = apply(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(output)
    }
}

impl Store for JsonFileStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::JsonFile
    }

    fn list_workspaces(&self) -> AppResult<Vec<Workspace>> {
        let mut workspaces = self.lock()?.workspaces.clone();
        newer_first(&mut workspaces, |workspace| workspace.created_at);
        Ok(workspaces)
    }

    fn get_workspace(&self, workspace_id: &str) -> AppResult<Option<Workspace>> {
        Ok(self
            .lock()?
            .workspaces
            .iter()
            .find(|workspace| workspace.id == workspace_id)
            .cloned())
    }

    fn create_workspace(&self, input: NewWorkspace) -> AppResult<Workspace> {
        let workspace = build_workspace(input)?;
        self.mutate(|state| {
            state.workspaces.push(workspace.clone());
            Ok(workspace)
        })
    }

    fn update_workspace(&self, workspace_id: &str, patch: WorkspacePatch) -> AppResult<Option<Workspace>> {
        self.mutate(|state| {
            let Some(workspace) = state.workspaces.iter_mut().find(|workspace| workspace.id == workspace_id) else {
                return Ok(None);
            };
            patch_workspace(workspace, patch)?;
            Ok(Some(workspace.clone()))
        })
    }

    fn set_workspace_status(&self, workspace_id: &str, status: WorkspaceStatus) -> AppResult<()> {
        self.mutate(|state| {
            let workspace = state.workspace_mut(workspace_id)?;
            workspace.status = status;
            workspace.updated_at = now_utc();
            Ok(())
        })
    }

    fn delete_workspace(&self, workspace_id: &str) -> AppResult<bool> {
        self.mutate(|state| {
            let before = state.workspaces.len();
            state.workspaces.retain(|workspace| workspace.id != workspace_id);
            if state.workspaces.len() == before {
                return Ok(false);
            }
            let run_ids = state
                .runs
                .iter()
                .filter(|run| run.workspace_id.as_deref() == Some(workspace_id))
                .map(|run| run.id.clone())
                .collect::<Vec<_>>();
            state.runs.retain(|run| run.workspace_id.as_deref() != Some(workspace_id));
            state.run_events.retain(|event| !run_ids.contains(&event.run_id));
            state
                .workspace_threads
                .retain(|link| link.workspace_id != workspace_id);
            Ok(true)
        })
    }

    fn create_run(&self, input: NewRun) -> AppResult<Run> {
        let run = build_run(input);
        self.mutate(|state| {
            state.runs.push(run.clone());
            Ok(run)
        })
    }

    fn get_run(&self, run_id: &str) -> AppResult<Option<Run>> {
        Ok(self.lock()?.runs.iter().find(|run| run.id == run_id).cloned())
    }

    fn list_runs(&self, filter: &ListRunsFilter) -> AppResult<Vec<Run>> {
        let mut runs = self
            .lock()?
            .runs
            .iter()
            .filter(|run| match &filter.workspace_id {
                Some(workspace_id) => run.workspace_id.as_deref() == Some(workspace_id.as_str()),
                None => true,
            })
            .cloned()
            .collect::<Vec<_>>();
        newer_first(&mut runs, |run| run.created_at);
        apply_limit(&mut runs, filter.limit);
        Ok(runs)
    }

    fn finish_run(&self, run_id: &str, exit_code: Option<i32>, last_snippet: Option<&str>) -> AppResult<()> {
        self.mutate(|state| {
            let run = state.run_mut(run_id)?;
            run.status = RunStatus::Done;
            run.exit_code = exit_code;
            if let Some(snippet) = last_snippet {
                run.last_snippet = Some(snippet.to_string());
            }
            run.updated_at = now_utc();
            Ok(())
        })
    }

    fn append_run_event(&self, run_id: &str, stream: RunStream, chunk: &str) -> AppResult<RunEvent> {
        self.mutate(|state| state.push_event(run_id, stream, chunk))
    }

    fn append_run_output(&self, run_id: &str, stream: RunStream, chunk: &str, snippet: &str) -> AppResult<RunEvent> {
        self.mutate(|state| {
            let event = state.push_event(run_id, stream, chunk)?;
            let run = state.run_mut(run_id)?;
            run.last_snippet = Some(snippet.to_string());
            run.updated_at = event.ts;
            Ok(event)
        })
    }

    fn list_run_events(&self, run_id: &str, after_seq: Option<i64>) -> AppResult<Vec<RunEvent>> {
        let after = after_seq.unwrap_or(0);
        let mut events = self
            .lock()?
            .run_events
            .iter()
            .filter(|event| event.run_id == run_id && event.seq > after)
            .cloned()
            .collect::<Vec<_>>();
        events.sort_by_key(|event| event.seq);
        Ok(events)
    }

    fn mark_stale_runs(&self) -> AppResult<u64> {
        self.mutate(|state| {
            let now = now_utc();
            let mut changed = 0_u64;
            for run in state.runs.iter_mut().filter(|run| run.status == RunStatus::Running) {
                run.status = RunStatus::Done;
                run.exit_code = Some(STALE_RUN_EXIT_CODE);
                run.updated_at = now;
                changed += 1;
            }
            Ok(changed)
        })
    }

    fn get_thread_meta(&self, thread_id: &str) -> AppResult<Option<ThreadMeta>> {
        Ok(self
            .lock()?
            .thread_meta
            .iter()
            .find(|meta| meta.thread_id == thread_id)
            .cloned())
    }

    fn upsert_thread_meta(&self, thread_id: &str, patch: ThreadMetaPatch) -> AppResult<ThreadMeta> {
        self.mutate(|state| {
            let index = match state.thread_meta.iter().position(|meta| meta.thread_id == thread_id) {
                Some(index) => index,
                None => {
                    state.thread_meta.push(ThreadMeta::new(thread_id));
                    state.thread_meta.len() - 1
                }
            };
            let meta = &mut state.thread_meta[index];
            patch.apply(meta);
            Ok(meta.clone())
        })
    }

    fn list_thread_meta(&self) -> AppResult<Vec<ThreadMeta>> {
        let mut metas = self.lock()?.thread_meta.clone();
        metas.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        Ok(metas)
    }

    fn link_workspace_thread(&self, workspace_id: &str, thread_id: &str) -> AppResult<WorkspaceThread> {
        self.mutate(|state| {
            state.workspace_mut(workspace_id)?;
            if let Some(existing) = state
                .workspace_threads
                .iter()
                .find(|link| link.workspace_id == workspace_id && link.thread_id == thread_id)
            {
                return Ok(existing.clone());
            }
            let link = WorkspaceThread {
                workspace_id: workspace_id.to_string(),
                thread_id: thread_id.to_string(),
                created_at: now_utc(),
            };
            state.workspace_threads.push(link.clone());
            Ok(link)
        })
    }

    fn unlink_workspace_thread(&self, workspace_id: &str, thread_id: &str) -> AppResult<bool> {
        self.mutate(|state| {
            let before = state.workspace_threads.len();
            state
                .workspace_threads
                .retain(|link| !(link.workspace_id == workspace_id && link.thread_id == thread_id));
            Ok(state.workspace_threads.len() != before)
        })
    }

    fn list_workspace_threads(&self, workspace_id: &str) -> AppResult<Vec<WorkspaceThread>> {
        let mut links = self
            .lock()?
            .workspace_threads
            .iter()
            .filter(|link| link.workspace_id == workspace_id)
            .cloned()
            .collect::<Vec<_>>();
        newer_first(&mut links, |link| link.created_at);
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_file_is_migrated_and_backed_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            serde_json::to_string(&serde_json::json!({
                "sessions": [{ "id": "sess-1", "title": "api", "repo_path": "/src/api",
                               "notify_mode": "needs_input_failed",
                               "created_at": "2024-01-01T00:00:00Z" }],
                "threads_map": { "thr-1": { "session_id": "sess-1" } }
            }))
            .expect("encode"),
        )
        .expect("write legacy");

        let store = JsonFileStore::open(&path).expect("open");
        let workspace = store.get_workspace("sess-1").expect("get").expect("workspace");
        assert_eq!(workspace.notify_policy, crate::models::NotifyPolicy::NeedsInputFailed);
        let links = store.list_workspace_threads("sess-1").expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].thread_id, "thr-1");
        assert!(path.with_extension("json.legacy").exists());

        let reopened = JsonFileStore::open(&path).expect("reopen");
        assert_eq!(reopened.list_workspaces().expect("list").len(), 1);
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        let store = JsonFileStore::open(&path).expect("open");
        let run = store
            .create_run(NewRun {
                workspace_id: None,
                run_type: "git_status".to_string(),
                command: "git status".to_string(),
                cwd: "/tmp".to_string(),
            })
            .expect("run");
        store
            .append_run_event(&run.id, RunStream::Stdout, "clean")
            .expect("event");
        drop(store);

        let reopened = JsonFileStore::open(&path).expect("reopen");
        let events = reopened.list_run_events(&run.id, None).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].chunk, "clean");
    }
}
