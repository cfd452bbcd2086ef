pub mod needs_input;
pub mod output;
pub mod summary;

use crate::adapters::spawn_errors::{describe_spawn_error, SPAWN_FAILURE_EXIT_CODE};
use crate::adapters::ValidatedCommand;
use crate::broadcast::{lock, ListenerSet, Subscription};
use crate::config::RunnerConfig;
use crate::db::Store;
use crate::errors::{AppError, AppResult};
use crate::models::{now_utc, NewRun, RunEvent, RunFinal, RunStream, RunStreamEvent};
use crate::notify::{spawn_detached, Notification, Notifier};
use needs_input::NeedsInputTracker;
use output::{normalize_chunk, Utf8Carry};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use summary::{derive_status, is_notable_transition, should_notify_with_threshold, summarize, tail_snippet};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

const MAX_CAPTURED_OUTPUT_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct StartRunRequest {
    pub workspace_id: Option<String>,
    pub run_type: String,
    pub command: ValidatedCommand,
}

#[derive(Debug, Clone)]
pub struct ExternalRunRequest {
    pub workspace_id: Option<String>,
    pub run_type: String,
    pub command: String,
    pub cwd: String,
}

#[derive(Default)]
struct CapturedOutput {
    chunks: VecDeque<String>,
    total_bytes: usize,
}

impl CapturedOutput {
    fn push(&mut self, chunk: &str) {
        self.chunks.push_back(chunk.to_string());
        self.total_bytes = self.total_bytes.saturating_add(chunk.len());
        while self.total_bytes > MAX_CAPTURED_OUTPUT_BYTES && self.chunks.len() > 1 {
            if let Some(front) = self.chunks.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(front.len());
            }
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
    }
}

struct RunTracker {
    run_id: String,
    workspace_id: Option<String>,
    run_type: String,
    managed: bool,
    started: Instant,
    needs_input: NeedsInputTracker,
    captured: CapturedOutput,
    snippet: String,
    finished: bool,
    listeners: ListenerSet<RunStreamEvent>,
}

struct RunInner {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    config: RunnerConfig,
    active: Mutex<HashMap<String, Arc<Mutex<RunTracker>>>>,
}

/// Owns every in-flight run: spawned commands and runs relayed from the
/// companion process. Chunks are persisted and broadcast under the run's lock
/// so subscribers observe them in `seq` order.
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<RunInner>,
}

impl RunManager {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, config: RunnerConfig) -> Self {
        Self {
            inner: Arc::new(RunInner {
                store,
                notifier,
                config,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn active_run_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        lock(&self.inner.active).contains_key(run_id)
    }

    /// Spawns the command and returns the run id right away. Failing to start
    /// the program still yields a run, finished with exit code 127.
    pub fn start_run(&self, request: StartRunRequest) -> AppResult<String> {
        let command = request.command;
        let run = self.inner.store.create_run(NewRun {
            workspace_id: request.workspace_id.clone(),
            run_type: request.run_type.clone(),
            command: command.display(),
            cwd: command.cwd.clone(),
        })?;
        self.track(&run.id, request.workspace_id, &request.run_type, true);
        tracing::info!(run_id = %run.id, run_type = %request.run_type, command = %run.command, "starting run");

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !command.cwd.is_empty() {
            process.current_dir(&command.cwd);
        }

        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(error) => {
                let message = describe_spawn_error(&command.program, &command.cwd, &error);
                tracing::warn!(run_id = %run.id, error = %error, "failed to spawn run");
                self.finalize(&run.id, Some(SPAWN_FAILURE_EXIT_CODE), Some(&message));
                return Ok(run.id);
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let manager = self.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            let stdout_task = stdout
                .map(|pipe| tokio::spawn(manager.clone().pump(run_id.clone(), RunStream::Stdout, pipe)));
            let stderr_task = stderr
                .map(|pipe| tokio::spawn(manager.clone().pump(run_id.clone(), RunStream::Stderr, pipe)));
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(error) => {
                    tracing::warn!(run_id = %run_id, error = %error, "failed to wait on run process");
                    None
                }
            };
            manager.finalize(&run_id, exit_code, None);
        });

        Ok(run.id)
    }

    async fn pump<R: AsyncRead + Unpin>(self, run_id: String, stream: RunStream, mut pipe: R) {
        let mut carry = Utf8Carry::default();
        let mut buf = [0_u8; 4096];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = carry.push(&buf[..n]);
                    if !text.is_empty() {
                        self.record_managed_chunk(&run_id, stream, &text);
                    }
                }
                Err(error) => {
                    tracing::warn!(run_id = %run_id, stream = stream.as_str(), error = %error, "run output read failed");
                    break;
                }
            }
        }
        let rest = carry.finish();
        if !rest.is_empty() {
            self.record_managed_chunk(&run_id, stream, &rest);
        }
    }

    fn record_managed_chunk(&self, run_id: &str, stream: RunStream, raw: &str) {
        let Some(tracker) = self.tracker(run_id) else {
            return;
        };
        let mut tracker = lock(&tracker);
        if tracker.finished {
            return;
        }
        let Some(text) = normalize_chunk(&tracker.run_type, raw) else {
            return;
        };
        if let Err(error) = self.record(&mut tracker, stream, &text) {
            tracing::warn!(run_id = %run_id, error = %error, "failed to record run output");
        }
    }

    pub fn start_external_run(&self, request: ExternalRunRequest) -> AppResult<String> {
        let run = self.inner.store.create_run(NewRun {
            workspace_id: request.workspace_id.clone(),
            run_type: request.run_type.clone(),
            command: request.command,
            cwd: request.cwd,
        })?;
        self.track(&run.id, request.workspace_id, &request.run_type, false);
        tracing::info!(run_id = %run.id, run_type = %request.run_type, "started external run");
        Ok(run.id)
    }

    /// Records a relayed chunk verbatim. Only empty chunks are skipped.
    pub fn append_external_event(&self, run_id: &str, stream: RunStream, chunk: &str) -> AppResult<Option<RunEvent>> {
        let tracker = self
            .tracker(run_id)
            .ok_or_else(|| AppError::NotFound(format!("Run {} is not active", run_id)))?;
        if chunk.is_empty() {
            return Ok(None);
        }
        let mut tracker = lock(&tracker);
        if tracker.finished {
            return Ok(None);
        }
        self.record(&mut tracker, stream, chunk).map(Some)
    }

    pub fn finalize_external_run(
        &self,
        run_id: &str,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> bool {
        self.finalize(run_id, exit_code, error_message)
    }

    /// Registers `handler` for future events of the run. For a run that is no
    /// longer active the returned subscription is detached and never fires.
    pub fn subscribe(&self, run_id: &str, handler: impl Fn(&RunStreamEvent) + Send + Sync + 'static) -> Subscription {
        let Some(tracker) = self.tracker(run_id) else {
            return Subscription::detached();
        };
        let tracker = lock(&tracker);
        if tracker.finished {
            return Subscription::detached();
        }
        tracker.listeners.subscribe(handler)
    }

    /// Finishes the run exactly once. Returns false when it was already
    /// finished or never tracked.
    pub fn finalize(&self, run_id: &str, exit_code: Option<i32>, error_message: Option<&str>) -> bool {
        let Some(tracker) = lock(&self.inner.active).remove(run_id) else {
            tracing::debug!(run_id = %run_id, "finalize ignored for inactive run");
            return false;
        };
        let mut tracker = lock(&tracker);
        if tracker.finished {
            return false;
        }

        let store = &self.inner.store;
        let status = derive_status(exit_code, tracker.needs_input.detected());
        let duration_secs = tracker.started.elapsed().as_secs();
        if let Some(message) = error_message.filter(|message| !message.trim().is_empty()) {
            if let Err(error) = self.record(&mut tracker, RunStream::Stderr, message) {
                tracing::warn!(run_id = %run_id, error = %error, "failed to record run error message");
            }
        }

        let snippet = (!tracker.snippet.is_empty()).then(|| tracker.snippet.clone());
        if let Err(error) = store.finish_run(run_id, exit_code, snippet.as_deref()) {
            tracing::warn!(run_id = %run_id, error = %error, "failed to persist finished run");
        }

        let mut workspace_update = None;
        if let Some(workspace_id) = tracker.workspace_id.clone() {
            match store.get_workspace(&workspace_id) {
                Ok(Some(workspace)) => {
                    if let Err(error) = store.set_workspace_status(&workspace_id, status) {
                        tracing::warn!(workspace_id = %workspace_id, error = %error, "failed to update workspace status");
                    }
                    workspace_update = Some(workspace);
                }
                Ok(None) => tracing::debug!(workspace_id = %workspace_id, "workspace removed before run finished"),
                Err(error) => tracing::warn!(workspace_id = %workspace_id, error = %error, "failed to read workspace"),
            }
        }

        tracker.finished = true;
        tracker.listeners.emit(&RunStreamEvent::Final(RunFinal {
            run_id: run_id.to_string(),
            exit_code,
            ts: now_utc(),
        }));
        tracker.listeners.clear();
        tracing::info!(
            run_id = %run_id,
            exit_code = ?exit_code,
            status = status.as_str(),
            duration_secs = duration_secs,
            managed = tracker.managed,
            "run finished"
        );

        if let Some(workspace) = workspace_update {
            let previous = workspace.status;
            let policy = workspace.notify_policy;
            let due = should_notify_with_threshold(policy, status, duration_secs, self.inner.config.notify_min_idle_secs)
                && is_notable_transition(previous, status);
            if due {
                let summary = summarize(&tracker.captured.snapshot(), status, self.inner.config.summary_max_chars);
                spawn_detached(
                    self.inner.notifier.clone(),
                    Notification {
                        workspace_id: workspace.id,
                        workspace_title: workspace.title,
                        run_id: run_id.to_string(),
                        run_type: tracker.run_type.clone(),
                        status,
                        previous_status: previous,
                        policy,
                        exit_code,
                        duration_secs,
                        summary,
                    },
                );
            }
        }
        true
    }

    fn track(&self, run_id: &str, workspace_id: Option<String>, run_type: &str, managed: bool) {
        let tracker = RunTracker {
            run_id: run_id.to_string(),
            workspace_id,
            run_type: run_type.to_string(),
            managed,
            started: Instant::now(),
            needs_input: NeedsInputTracker::for_run_type(run_type),
            captured: CapturedOutput::default(),
            snippet: String::new(),
            finished: false,
            listeners: ListenerSet::new(),
        };
        lock(&self.inner.active).insert(run_id.to_string(), Arc::new(Mutex::new(tracker)));
    }

    fn tracker(&self, run_id: &str) -> Option<Arc<Mutex<RunTracker>>> {
        lock(&self.inner.active).get(run_id).cloned()
    }

    // Caller holds the tracker lock, which is what orders seq with broadcast.
    fn record(&self, tracker: &mut RunTracker, stream: RunStream, text: &str) -> AppResult<RunEvent> {
        let snippet = tail_snippet(&tracker.snippet, text, self.inner.config.snippet_max_chars);
        let event = self
            .inner
            .store
            .append_run_output(&tracker.run_id, stream, text, &snippet)?;
        tracker.snippet = snippet;
        if tracker.needs_input.observe(text) {
            tracing::info!(run_id = %tracker.run_id, "run is waiting for input");
        }
        tracker.captured.push(text);
        tracker.listeners.emit(&RunStreamEvent::Chunk(event.clone()));
        Ok(event)
    }
}

impl std::fmt::Debug for RunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunManager")
            .field("active_runs", &self.active_run_count())
            .finish()
    }
}
