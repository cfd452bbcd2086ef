use crate::adapters::{build_command, RunKind};
use crate::companion::{CompanionManager, CompanionStatusSnapshot};
use crate::config::AppConfig;
use crate::db::Store;
use crate::errors::AppError;
use crate::models::{
    now_utc, ListRunsFilter, NewWorkspace, Run, RunEvent, RunFinal, RunStreamEvent, Workspace, WorkspacePatch,
};
use crate::relay::{ThreadMessageStarted, ThreadRelay};
use crate::runner::{RunManager, StartRunRequest};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

const SSE_KEEP_ALIVE_SECS: u64 = 15;
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(25);
const FINISH_POLL_ATTEMPTS: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub runs: RunManager,
    pub companion: CompanionManager,
    pub relay: ThreadRelay,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn Store>, runs: RunManager, companion: CompanionManager) -> Self {
        let relay = ThreadRelay::new(companion.clone(), runs.clone());
        Self {
            config: Arc::new(config),
            store,
            runs,
            companion,
            relay,
        }
    }
}

/// Error body returned by every route.
#[derive(Debug)]
pub struct ApiError {
    error: AppError,
    logs: Option<Vec<String>>,
}

impl ApiError {
    fn with_companion_logs(error: AppError, companion: &CompanionManager) -> Self {
        let logs = match error {
            AppError::Unavailable(_) | AppError::ProcessExited(_) => Some(companion.log_lines()),
            _ => None,
        };
        Self { error, logs }
    }

    fn status_code(&self) -> StatusCode {
        match self.error {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::Protocol { .. } | AppError::ProcessExited(_) => StatusCode::BAD_GATEWAY,
            AppError::Io(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AppError> for ApiError {
    fn from(error: AppError) -> Self {
        Self { error, logs: None }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = self.error.code(), error = %self.error, "request failed");
        }
        let mut body = json!({
            "error": self.error.code(),
            "message": self.error.to_string(),
        });
        if let Some(logs) = self.logs {
            body["logs"] = json!(logs);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/workspaces", get(list_workspaces).post(create_workspace))
        .route("/api/workspaces/{id}", patch(update_workspace).delete(delete_workspace))
        .route("/api/workspaces/{id}/runs", get(list_workspace_runs).post(start_workspace_run))
        .route("/api/workspaces/{id}/threads/messages", post(send_thread_message))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/stream", get(stream_run))
        .route("/api/companion", get(companion_status))
        .with_state(state)
}

/// Serves until ctrl-c.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %error, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "store": state.store.backend().as_str(),
        "companion": state.companion.status().state.as_str(),
        "active_runs": state.runs.active_run_count(),
    }))
}

async fn list_workspaces(State(state): State<AppState>) -> ApiResult<Json<Vec<Workspace>>> {
    Ok(Json(state.store.list_workspaces()?))
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(input): Json<NewWorkspace>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    let workspace = state.store.create_workspace(input)?;
    tracing::info!(workspace_id = %workspace.id, repo_path = %workspace.repo_path, "created workspace");
    Ok((StatusCode::CREATED, Json(workspace)))
}

async fn update_workspace(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(patch): Json<WorkspacePatch>,
) -> ApiResult<Json<Workspace>> {
    state
        .store
        .update_workspace(&workspace_id, patch)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Workspace {} not found", workspace_id)).into())
}

async fn delete_workspace(State(state): State<AppState>, Path(workspace_id): Path<String>) -> ApiResult<StatusCode> {
    if state.store.delete_workspace(&workspace_id)? {
        tracing::info!(workspace_id = %workspace_id, "deleted workspace");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Workspace {} not found", workspace_id)).into())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn list_workspace_runs(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    let filter = ListRunsFilter {
        workspace_id: Some(workspace_id),
        limit: query.limit,
    };
    Ok(Json(state.store.list_runs(&filter)?))
}

#[derive(Debug, Deserialize)]
struct StartRunBody {
    #[serde(rename = "type")]
    run_type: String,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartedRun {
    run_id: String,
}

async fn start_workspace_run(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(body): Json<StartRunBody>,
) -> ApiResult<(StatusCode, Json<StartedRun>)> {
    let kind = RunKind::parse(&body.run_type)?;
    let workspace = state
        .store
        .get_workspace(&workspace_id)?
        .ok_or_else(|| AppError::NotFound(format!("Workspace {} not found", workspace_id)))?;
    let command = build_command(kind, &workspace, body.prompt.as_deref(), &state.config.runner)?;
    let run_id = state.runs.start_run(StartRunRequest {
        workspace_id: Some(workspace.id),
        run_type: kind.as_str().to_string(),
        command,
    })?;
    Ok((StatusCode::ACCEPTED, Json(StartedRun { run_id })))
}

#[derive(Debug, Deserialize)]
struct ThreadMessageBody {
    text: String,
    #[serde(default)]
    thread_id: Option<String>,
}

async fn send_thread_message(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(body): Json<ThreadMessageBody>,
) -> ApiResult<(StatusCode, Json<ThreadMessageStarted>)> {
    let started = state
        .relay
        .send_thread_message(&workspace_id, body.thread_id.as_deref(), &body.text)
        .await
        .map_err(|error| ApiError::with_companion_logs(error, &state.companion))?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

#[derive(Debug, Default, Deserialize)]
struct RunEventsQuery {
    after_seq: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RunDetail {
    run: Run,
    events: Vec<RunEvent>,
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<RunEventsQuery>,
) -> ApiResult<Json<RunDetail>> {
    let run = state
        .store
        .get_run(&run_id)?
        .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))?;
    let events = state.store.list_run_events(&run_id, query.after_seq)?;
    Ok(Json(RunDetail { run, events }))
}

#[derive(Debug, Serialize)]
struct CompanionReport {
    status: CompanionStatusSnapshot,
    logs: Vec<String>,
}

async fn companion_status(State(state): State<AppState>) -> Json<CompanionReport> {
    Json(CompanionReport {
        status: state.companion.status(),
        logs: state.companion.log_lines(),
    })
}

fn sse_event(event: &RunStreamEvent) -> Event {
    let (name, payload) = match event {
        RunStreamEvent::Chunk(chunk) => ("chunk", serde_json::to_string(chunk)),
        RunStreamEvent::Final(done) => ("final", serde_json::to_string(done)),
    };
    match payload {
        Ok(data) => Event::default().event(name).data(data),
        Err(error) => Event::default().event("error").data(error.to_string()),
    }
}

/// Streams a run: persisted events first, then live events, then one `final`.
/// The live subscription is taken before reading the store so nothing falls
/// between the replay and the live tail; overlaps are dropped by `seq`.
async fn stream_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (live_tx, mut live_rx) = mpsc::unbounded_channel::<RunStreamEvent>();
    let subscription = state.runs.subscribe(&run_id, move |event| {
        let _ = live_tx.send(event.clone());
    });

    let run = state
        .store
        .get_run(&run_id)?
        .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))?;
    let replay = state.store.list_run_events(&run_id, None)?;

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let store = state.store.clone();
    tokio::spawn(async move {
        let mut last_seq = 0;
        for event in replay {
            last_seq = event.seq;
            if out_tx.send(Ok(sse_event(&RunStreamEvent::Chunk(event)))).is_err() {
                return;
            }
        }

        if run.is_done() || !subscription.is_active() {
            drop(subscription);
            let finished = wait_until_finished(store.as_ref(), &run_id, run).await;
            if let Ok(events) = store.list_run_events(&run_id, Some(last_seq)) {
                for event in events {
                    if out_tx.send(Ok(sse_event(&RunStreamEvent::Chunk(event)))).is_err() {
                        return;
                    }
                }
            }
            let done = RunStreamEvent::Final(RunFinal {
                run_id: finished.id.clone(),
                exit_code: finished.exit_code,
                ts: finished.updated_at,
            });
            let _ = out_tx.send(Ok(sse_event(&done)));
            return;
        }

        let _subscription = subscription;
        while let Some(event) = live_rx.recv().await {
            let is_final = matches!(event, RunStreamEvent::Final(_));
            if let RunStreamEvent::Chunk(chunk) = &event {
                if chunk.seq <= last_seq {
                    continue;
                }
                last_seq = chunk.seq;
            }
            if out_tx.send(Ok(sse_event(&event))).is_err() || is_final {
                return;
            }
        }
    });

    Ok(Sse::new(UnboundedReceiverStream::new(out_rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(SSE_KEEP_ALIVE_SECS))))
}

// A run that left the active set may not be persisted as done yet.
async fn wait_until_finished(store: &dyn Store, run_id: &str, mut run: Run) -> Run {
    for _ in 0..FINISH_POLL_ATTEMPTS {
        if run.is_done() {
            return run;
        }
        tokio::time::sleep(FINISH_POLL_INTERVAL).await;
        match store.get_run(run_id) {
            Ok(Some(latest)) => run = latest,
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(run_id = %run_id, error = %error, "failed to re-read run");
                break;
            }
        }
    }
    if !run.is_done() {
        tracing::debug!(run_id = %run_id, "stream closing on a run with no live tracker");
        run.updated_at = now_utc();
    }
    run
}
