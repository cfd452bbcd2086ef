use crate::broadcast::{lock, Subscription};
use crate::companion::extract;
use crate::companion::protocol::CompanionMessage;
use crate::companion::CompanionManager;
use crate::db::Store;
use crate::errors::{AppError, AppResult};
use crate::models::{now_utc, RunStream, ThreadMetaPatch, Workspace, WorkspacePatch};
use crate::runner::{ExternalRunRequest, RunManager};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const THREAD_RUN_TYPE: &str = "codex_thread";

const AGENT_DELTA_METHOD: &str = "item/agentMessage/delta";
const ERROR_METHOD: &str = "error";
const TURN_COMPLETED_METHOD: &str = "turn/completed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadMessageStarted {
    pub run_id: String,
    pub thread_id: String,
}

// Both handles are dropped together when the run finishes.
struct RelayedTurn {
    _messages: Subscription,
    _exit: Subscription,
}

/// Turns companion thread traffic into external runs.
#[derive(Clone)]
pub struct ThreadRelay {
    companion: CompanionManager,
    runs: RunManager,
    subscriptions: Arc<Mutex<HashMap<String, RelayedTurn>>>,
}

impl ThreadRelay {
    pub fn new(companion: CompanionManager, runs: RunManager) -> Self {
        Self {
            companion,
            runs,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.runs.store()
    }

    fn workspace(&self, workspace_id: &str) -> AppResult<Workspace> {
        self.store()
            .get_workspace(workspace_id)?
            .ok_or_else(|| AppError::NotFound(format!("Workspace {} not found", workspace_id)))
    }

    pub fn relayed_run_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Returns the workspace's default thread, starting one on the companion
    /// when the workspace has none yet.
    pub async fn ensure_workspace_thread(&self, workspace_id: &str) -> AppResult<String> {
        let workspace = self.workspace(workspace_id)?;
        if let Some(thread_id) = workspace
            .default_thread_id
            .as_deref()
            .map(str::trim)
            .filter(|thread_id| !thread_id.is_empty())
        {
            return Ok(thread_id.to_string());
        }

        let result = self
            .companion
            .request("thread/start", json!({ "cwd": workspace.repo_path }))
            .await?;
        let thread_id = extract::thread_id(&result).ok_or_else(|| AppError::Protocol {
            code: 0,
            message: "thread/start response did not include a thread id".to_string(),
            data: Some(result.clone()),
        })?;

        let store = self.store();
        store.link_workspace_thread(workspace_id, &thread_id)?;
        store.update_workspace(
            workspace_id,
            WorkspacePatch {
                default_thread_id: Some(Some(thread_id.clone())),
                ..WorkspacePatch::default()
            },
        )?;
        self.touch_thread(&thread_id);
        tracing::info!(workspace_id = %workspace_id, thread_id = %thread_id, "started workspace thread");
        Ok(thread_id)
    }

    /// Sends `text` as a new turn and relays the reply into an external run.
    pub async fn send_thread_message(
        &self,
        workspace_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> AppResult<ThreadMessageStarted> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Message text cannot be empty".to_string()));
        }
        let workspace = self.workspace(workspace_id)?;
        if !self.companion.is_ready() {
            return Err(AppError::Unavailable(format!(
                "companion process is {}",
                self.companion.status().state.as_str()
            )));
        }

        let thread_id = match thread_id.map(str::trim).filter(|thread_id| !thread_id.is_empty()) {
            Some(thread_id) => {
                self.store().link_workspace_thread(workspace_id, thread_id)?;
                thread_id.to_string()
            }
            None => self.ensure_workspace_thread(workspace_id).await?,
        };

        let run_id = self.runs.start_external_run(ExternalRunRequest {
            workspace_id: Some(workspace.id.clone()),
            run_type: THREAD_RUN_TYPE.to_string(),
            command: format!("turn/start {}", thread_id),
            cwd: workspace.repo_path.clone(),
        })?;

        let turn_id = Arc::new(Mutex::new(None::<String>));
        let generation = self.companion.status().generation;
        let messages = {
            let relay = self.clone();
            let run_id = run_id.clone();
            let thread_id = thread_id.clone();
            let turn_id = turn_id.clone();
            self.companion
                .subscribe(move |message| relay.handle_message(&run_id, &thread_id, &turn_id, message))
        };
        // The turn lives in this process; a restarted one never completes it.
        let exit = {
            let relay = self.clone();
            let run_id = run_id.clone();
            self.companion.on_exit(move |exit| {
                if exit.generation != generation {
                    return;
                }
                tracing::warn!(run_id = %run_id, reason = %exit.reason, "companion exited mid-turn");
                let message = format!("companion process exited before the turn completed: {}", exit.reason);
                relay.finish(&run_id, Some(1), Some(&message));
            })
        };
        lock(&self.subscriptions).insert(
            run_id.clone(),
            RelayedTurn {
                _messages: messages,
                _exit: exit,
            },
        );
        self.touch_thread(&thread_id);

        let params = json!({
            "threadId": thread_id,
            "input": [{ "type": "text", "text": text }],
        });
        match self.companion.request("turn/start", params).await {
            Ok(result) => {
                if let Some(id) = extract::turn_id(&result) {
                    lock(&turn_id).get_or_insert(id);
                }
            }
            Err(error) => {
                tracing::warn!(run_id = %run_id, thread_id = %thread_id, error = %error, "turn/start failed");
                self.finish(&run_id, Some(1), Some(&error.to_string()));
            }
        }

        Ok(ThreadMessageStarted { run_id, thread_id })
    }

    fn handle_message(&self, run_id: &str, thread_id: &str, turn_id: &Mutex<Option<String>>, message: &CompanionMessage) {
        if extract::thread_id(&message.params).as_deref() != Some(thread_id) {
            return;
        }
        if let Some(incoming) = extract::turn_id(&message.params) {
            let mut current = lock(turn_id);
            match current.as_deref() {
                Some(known) if known != incoming => return,
                Some(_) => {}
                None => *current = Some(incoming),
            }
        }

        match message.method.as_str() {
            AGENT_DELTA_METHOD => {
                if let Some(delta) = extract::delta_text(&message.params) {
                    self.append(run_id, RunStream::Stdout, &delta);
                }
            }
            ERROR_METHOD => {
                let text = extract::error_message(&message.params)
                    .unwrap_or_else(|| "companion reported an error".to_string());
                self.append(run_id, RunStream::Stderr, &text);
            }
            TURN_COMPLETED_METHOD => {
                let status = extract::turn_status(&message.params);
                let exit_code = match status.as_deref() {
                    Some("failed") | Some("interrupted") => 1,
                    _ => 0,
                };
                self.finish(run_id, Some(exit_code), None);
            }
            _ => {}
        }
    }

    fn append(&self, run_id: &str, stream: RunStream, chunk: &str) {
        if let Err(error) = self.runs.append_external_event(run_id, stream, chunk) {
            tracing::debug!(run_id = %run_id, error = %error, "dropping relayed chunk");
        }
    }

    fn finish(&self, run_id: &str, exit_code: Option<i32>, error_message: Option<&str>) {
        self.runs.finalize_external_run(run_id, exit_code, error_message);
        // Removing drops the subscriptions; listeners run outside the registry lock.
        let relayed = lock(&self.subscriptions).remove(run_id);
        drop(relayed);
    }

    fn touch_thread(&self, thread_id: &str) {
        let patch = ThreadMetaPatch {
            last_seen_at: Some(now_utc()),
            ..ThreadMetaPatch::default()
        };
        if let Err(error) = self.store().upsert_thread_meta(thread_id, patch) {
            tracing::warn!(thread_id = %thread_id, error = %error, "failed to update thread metadata");
        }
    }
}
