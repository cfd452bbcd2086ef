pub mod extract;
pub mod framing;
pub mod protocol;

use crate::broadcast::{lock, ListenerSet, Subscription};
use crate::config::CompanionConfig;
use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use framing::LineFramer;
use protocol::{classify, method_not_found, CompanionMessage, Inbound, OutboundNotification, OutboundRequest};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanionState {
    Stopped,
    Starting,
    Ready,
    Error,
}

impl CompanionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanionStatusSnapshot {
    pub state: CompanionState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub restarts_scheduled: u64,
    pub restart_pending: bool,
    pub ready_since: Option<DateTime<Utc>>,
}

/// Published once per process generation when that process goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionExit {
    pub generation: u64,
    pub reason: String,
}

type PendingReply = oneshot::Sender<AppResult<Value>>;

#[derive(Debug)]
struct Supervision {
    state: CompanionState,
    generation: u64,
    failed_generation: u64,
    writer: Option<mpsc::UnboundedSender<String>>,
    kill: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
    last_error: Option<String>,
    consecutive_failures: u32,
    restarts_scheduled: u64,
    restart_pending: bool,
    ready_since: Option<DateTime<Utc>>,
}

struct Inner {
    config: CompanionConfig,
    supervision: Mutex<Supervision>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_id: AtomicU64,
    listeners: ListenerSet<CompanionMessage>,
    exits: ListenerSet<CompanionExit>,
    logs: Mutex<VecDeque<String>>,
}

/// Supervises the single long-lived companion process and multiplexes
/// JSON-RPC traffic over its stdio.
#[derive(Clone)]
pub struct CompanionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CompanionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionManager")
            .field("program", &self.inner.config.program)
            .field("state", &self.status().state)
            .finish()
    }
}

impl CompanionManager {
    pub fn new(config: CompanionConfig) -> Self {
        let capacity = config.log_capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                supervision: Mutex::new(Supervision {
                    state: CompanionState::Stopped,
                    generation: 0,
                    failed_generation: 0,
                    writer: None,
                    kill: None,
                    pid: None,
                    last_error: None,
                    consecutive_failures: 0,
                    restarts_scheduled: 0,
                    restart_pending: false,
                    ready_since: None,
                }),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                listeners: ListenerSet::new(),
                exits: ListenerSet::new(),
                logs: Mutex::new(VecDeque::with_capacity(capacity)),
            }),
        }
    }

    /// Begins supervision. Must be called from within a tokio runtime.
    pub fn start(&self) {
        {
            let mut supervision = lock(&self.inner.supervision);
            match supervision.state {
                CompanionState::Starting | CompanionState::Ready => {
                    tracing::info!(state = supervision.state.as_str(), "companion already started");
                    return;
                }
                CompanionState::Stopped | CompanionState::Error => {
                    supervision.restart_pending = false;
                }
            }
        }
        self.launch();
    }

    pub fn status(&self) -> CompanionStatusSnapshot {
        let supervision = lock(&self.inner.supervision);
        CompanionStatusSnapshot {
            state: supervision.state,
            pid: supervision.pid,
            generation: supervision.generation,
            last_error: supervision.last_error.clone(),
            consecutive_failures: supervision.consecutive_failures,
            restarts_scheduled: supervision.restarts_scheduled,
            restart_pending: supervision.restart_pending,
            ready_since: supervision.ready_since,
        }
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.inner.supervision).state == CompanionState::Ready
    }

    pub fn log_lines(&self) -> Vec<String> {
        lock(&self.inner.logs).iter().cloned().collect()
    }

    pub fn pending_request_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Polls until the process reaches `ready` or the deadline passes.
    pub async fn wait_ready(&self, timeout: Duration) -> AppResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_ready() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let status = self.status();
                return Err(AppError::Unavailable(format!(
                    "companion process is {}{}",
                    status.state.as_str(),
                    status
                        .last_error
                        .map(|error| format!(": {}", error))
                        .unwrap_or_default()
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&CompanionMessage) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.subscribe(handler)
    }

    pub fn on_exit(&self, handler: impl Fn(&CompanionExit) + Send + Sync + 'static) -> Subscription {
        self.inner.exits.subscribe(handler)
    }

    pub async fn request(&self, method: &str, params: Value) -> AppResult<Value> {
        self.request_with_timeout(method, params, self.inner.config.request_timeout())
            .await
    }

    pub async fn request_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> AppResult<Value> {
        let writer = {
            let supervision = lock(&self.inner.supervision);
            match (&supervision.state, &supervision.writer) {
                (CompanionState::Ready, Some(writer)) => writer.clone(),
                (state, _) => {
                    return Err(AppError::Unavailable(format!(
                        "companion process is {}",
                        state.as_str()
                    )))
                }
            }
        };
        self.send_request(&writer, method, &params, timeout).await
    }

    /// Fire-and-forget. Dropped when no process is attached.
    pub fn notify(&self, method: &str, params: Value) {
        let writer = lock(&self.inner.supervision).writer.clone();
        let Some(writer) = writer else {
            tracing::debug!(method = method, "dropping companion notification, no process attached");
            return;
        };
        match serde_json::to_string(&OutboundNotification { method, params: &params }) {
            Ok(line) => {
                if writer.send(line).is_err() {
                    tracing::debug!(method = method, "companion stdin closed, notification dropped");
                }
            }
            Err(error) => tracing::warn!(error = %error, method = method, "failed to encode notification"),
        }
    }

    async fn send_request(
        &self,
        writer: &mpsc::UnboundedSender<String>,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> AppResult<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&OutboundRequest { id, method, params })?;
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);

        if writer.send(line).is_err() {
            lock(&self.inner.pending).remove(&id);
            return Err(AppError::ProcessExited("companion stdin is closed".to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(AppError::ProcessExited(
                "companion process went away before replying".to_string(),
            )),
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                tracing::warn!(method = method, id = id, "companion request timed out");
                Err(AppError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn launch(&self) {
        let generation = {
            let mut supervision = lock(&self.inner.supervision);
            supervision.generation += 1;
            supervision.state = CompanionState::Starting;
            supervision.restart_pending = false;
            supervision.ready_since = None;
            supervision.generation
        };
        let config = &self.inner.config;
        self.push_log(format!(
            "starting companion process (generation {}): {} {}",
            generation,
            config.program,
            config.args.join(" ")
        ));
        if let Err(error) = self.spawn_child(generation) {
            self.handle_failure(generation, format!("failed to spawn companion process: {}", error));
        }
    }

    fn spawn_child(&self, generation: u64) -> AppResult<()> {
        let config = &self.inner.config;
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Internal("companion stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal("companion stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Internal("companion stderr unavailable".to_string()))?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        {
            let mut supervision = lock(&self.inner.supervision);
            if supervision.generation != generation {
                return Ok(());
            }
            supervision.writer = Some(writer_tx.clone());
            supervision.kill = Some(kill_tx);
            supervision.pid = child.id();
        }
        tracing::info!(pid = ?child.id(), generation = generation, "companion process spawned");

        tokio::spawn(write_stdin(stdin, writer_rx));
        tokio::spawn(self.clone().read_stdout(generation, stdout));
        tokio::spawn(self.clone().read_stderr(stderr));

        let manager = self.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => format!("companion process exited with {}", status),
                    Err(error) => format!("failed to wait on companion process: {}", error),
                },
                _ = kill_rx => {
                    let _ = child.kill().await;
                    return;
                }
            };
            manager.handle_failure(generation, reason);
        });

        tokio::spawn(self.clone().handshake(generation, writer_tx));
        Ok(())
    }

    async fn handshake(self, generation: u64, writer: mpsc::UnboundedSender<String>) {
        let config = &self.inner.config;
        let params = json!({
            "clientInfo": {
                "name": config.client_name,
                "title": config.client_title,
                "version": config.client_version,
            }
        });
        match self
            .send_request(&writer, "initialize", &params, config.handshake_timeout())
            .await
        {
            Ok(_) => {
                {
                    let mut supervision = lock(&self.inner.supervision);
                    if supervision.generation != generation || supervision.state != CompanionState::Starting {
                        return;
                    }
                    supervision.state = CompanionState::Ready;
                    supervision.consecutive_failures = 0;
                    supervision.last_error = None;
                    supervision.ready_since = Some(Utc::now());
                }
                self.notify("initialized", json!({}));
                self.push_log(format!("companion ready (generation {})", generation));
            }
            Err(error) => {
                self.handle_failure(generation, format!("initialize handshake failed: {}", error));
            }
        }
    }

    async fn read_stdout(self, generation: u64, mut stdout: ChildStdout) {
        let mut framer = LineFramer::new(MAX_FRAME_BYTES);
        let mut buf = [0_u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in framer.push(&buf[..n]) {
                        self.handle_line(generation, &line);
                    }
                    let dropped = framer.consume_discarded_frames();
                    if dropped > 0 {
                        tracing::warn!(dropped = dropped, "discarded oversized companion frames");
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "companion stdout read failed");
                    break;
                }
            }
        }
        if let Some(line) = framer.flush() {
            self.handle_line(generation, &line);
        }
        self.handle_failure(generation, "companion stdout closed".to_string());
    }

    async fn read_stderr(self, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            tracing::debug!(target: "companion_stderr", line = %line);
            self.push_log(line);
        }
    }

    fn handle_line(&self, generation: u64, line: &str) {
        let writer = {
            let supervision = lock(&self.inner.supervision);
            if supervision.generation != generation {
                return;
            }
            supervision.writer.clone()
        };

        match classify(line) {
            Some(Inbound::Response { id, outcome }) => {
                let Some(reply) = lock(&self.inner.pending).remove(&id) else {
                    tracing::debug!(id = id, "dropping response without a pending request");
                    return;
                };
                let _ = reply.send(outcome.map_err(|error| AppError::Protocol {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }));
            }
            Some(Inbound::ServerRequest { id, method, params }) => {
                if let Some(writer) = writer {
                    let _ = writer.send(method_not_found(&id, &method));
                }
                self.inner.listeners.emit(&CompanionMessage {
                    method,
                    params,
                    request_id: Some(id),
                });
            }
            Some(Inbound::Notification { method, params }) => {
                self.inner.listeners.emit(&CompanionMessage {
                    method,
                    params,
                    request_id: None,
                });
            }
            None => {
                tracing::trace!(line = %line, "ignoring non-protocol companion output");
            }
        }
    }

    fn handle_failure(&self, generation: u64, reason: String) {
        let delay = {
            let mut supervision = lock(&self.inner.supervision);
            if supervision.generation != generation || supervision.failed_generation == generation {
                return;
            }
            supervision.failed_generation = generation;
            supervision.state = CompanionState::Error;
            supervision.last_error = Some(reason.clone());
            supervision.writer = None;
            supervision.pid = None;
            supervision.ready_since = None;
            if let Some(kill) = supervision.kill.take() {
                let _ = kill.send(());
            }
            let delay = self.inner.config.restart_delay(supervision.consecutive_failures);
            supervision.consecutive_failures = supervision.consecutive_failures.saturating_add(1);
            if supervision.restart_pending {
                None
            } else {
                supervision.restart_pending = true;
                supervision.restarts_scheduled += 1;
                Some((delay, supervision.restarts_scheduled))
            }
        };

        tracing::warn!(generation = generation, reason = %reason, "companion process failed");
        self.push_log(reason.clone());

        let pending = std::mem::take(&mut *lock(&self.inner.pending));
        for (_, reply) in pending {
            let _ = reply.send(Err(AppError::ProcessExited(reason.clone())));
        }
        self.inner.exits.emit(&CompanionExit {
            generation,
            reason: reason.clone(),
        });

        if let Some((delay, ticket)) = delay {
            tracing::info!(delay_ms = delay.as_millis() as u64, "companion restart scheduled");
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.restart_due(ticket);
            });
        }
    }

    // A ticket that no longer matches belongs to a timer superseded by `start`.
    fn restart_due(&self, ticket: u64) {
        {
            let supervision = lock(&self.inner.supervision);
            if !supervision.restart_pending
                || supervision.restarts_scheduled != ticket
                || supervision.state != CompanionState::Error
            {
                return;
            }
        }
        self.launch();
    }

    fn push_log(&self, line: String) {
        let capacity = self.inner.config.log_capacity.max(1);
        let mut logs = lock(&self.inner.logs);
        while logs.len() >= capacity {
            logs.pop_front();
        }
        logs.push_back(line);
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}
