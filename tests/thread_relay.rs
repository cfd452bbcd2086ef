#![cfg(unix)]

use local_agent_dashboard_lib::companion::CompanionManager;
use local_agent_dashboard_lib::config::{CompanionConfig, RunnerConfig};
use local_agent_dashboard_lib::db::{JsonFileStore, Store};
use local_agent_dashboard_lib::errors::AppError;
use local_agent_dashboard_lib::models::{NewWorkspace, RunStream};
use local_agent_dashboard_lib::notify::LogNotifier;
use local_agent_dashboard_lib::relay::{ThreadRelay, THREAD_RUN_TYPE};
use local_agent_dashboard_lib::runner::RunManager;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Setup {
    _dir: TempDir,
    store: Arc<dyn Store>,
    runs: RunManager,
    relay: ThreadRelay,
    workspace_id: String,
}

async fn setup() -> Setup {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn Store> = Arc::new(JsonFileStore::open(&dir.path().join("state.json")).expect("store"));
    let workspace_id = store
        .create_workspace(NewWorkspace {
            title: "api".to_string(),
            repo_path: dir.path().to_string_lossy().to_string(),
            ..NewWorkspace::default()
        })
        .expect("workspace")
        .id;
    let runs = RunManager::new(store.clone(), Arc::new(LogNotifier), RunnerConfig::default());
    let companion = CompanionManager::new(CompanionConfig {
        program: "bash".to_string(),
        args: vec![
            format!("{}/tests/fixtures/mock-app-server.sh", env!("CARGO_MANIFEST_DIR")),
            "normal".to_string(),
        ],
        ..CompanionConfig::default()
    });
    companion.start();
    companion
        .wait_ready(Duration::from_secs(5))
        .await
        .expect("companion ready");
    let relay = ThreadRelay::new(companion, runs.clone());
    Setup {
        _dir: dir,
        store,
        runs,
        relay,
        workspace_id,
    }
}

async fn wait_done(setup: &Setup, run_id: &str) {
    for _ in 0..200 {
        let done = setup
            .store
            .get_run(run_id)
            .expect("get run")
            .is_some_and(|run| run.is_done());
        if done && setup.relay.relayed_run_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("relayed run {} did not finish", run_id);
}

#[tokio::test]
async fn default_thread_is_started_once() {
    let setup = setup().await;
    let first = setup
        .relay
        .ensure_workspace_thread(&setup.workspace_id)
        .await
        .expect("thread");
    let second = setup
        .relay
        .ensure_workspace_thread(&setup.workspace_id)
        .await
        .expect("thread again");
    assert_eq!(first, "thr_mock");
    assert_eq!(second, first);

    let workspace = setup
        .store
        .get_workspace(&setup.workspace_id)
        .expect("get")
        .expect("workspace");
    assert_eq!(workspace.default_thread_id.as_deref(), Some("thr_mock"));
    let links = setup.store.list_workspace_threads(&setup.workspace_id).expect("links");
    assert_eq!(links.len(), 1);
    let meta = setup.store.get_thread_meta("thr_mock").expect("meta").expect("meta exists");
    assert!(meta.last_seen_at.is_some());
}

#[tokio::test]
async fn relayed_turn_ignores_other_threads() {
    let setup = setup().await;
    let started = setup
        .relay
        .send_thread_message(&setup.workspace_id, Some("thr_explicit"), "hello there")
        .await
        .expect("send");
    assert_eq!(started.thread_id, "thr_explicit");
    wait_done(&setup, &started.run_id).await;

    let run = setup.store.get_run(&started.run_id).expect("get").expect("run");
    assert_eq!(run.run_type, THREAD_RUN_TYPE);
    assert_eq!(run.exit_code, Some(0));
    let stdout = setup
        .store
        .list_run_events(&started.run_id, None)
        .expect("events")
        .into_iter()
        .filter(|event| event.stream == RunStream::Stdout)
        .map(|event| event.chunk)
        .collect::<String>();
    assert_eq!(stdout, "Hello world");
    assert!(!setup.runs.is_active(&started.run_id));

    let links = setup.store.list_workspace_threads(&setup.workspace_id).expect("links");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].thread_id, "thr_explicit");
    let workspace = setup
        .store
        .get_workspace(&setup.workspace_id)
        .expect("get")
        .expect("workspace");
    assert_eq!(workspace.default_thread_id, None);
}

#[tokio::test]
async fn blank_messages_are_rejected_before_any_run() {
    let setup = setup().await;
    let outcome = setup
        .relay
        .send_thread_message(&setup.workspace_id, None, "   ")
        .await;
    assert!(matches!(outcome, Err(AppError::Validation(_))));
    let outcome = setup.relay.send_thread_message("missing", None, "hi").await;
    assert!(matches!(outcome, Err(AppError::NotFound(_))));
    assert_eq!(setup.runs.active_run_count(), 0);
}

#[tokio::test]
async fn companion_exit_mid_turn_fails_the_relayed_run() {
    let setup = setup().await;
    let started = setup
        .relay
        .send_thread_message(&setup.workspace_id, Some("thr_explicit"), "please crash")
        .await
        .expect("send");
    wait_done(&setup, &started.run_id).await;

    let run = setup.store.get_run(&started.run_id).expect("get").expect("run");
    assert_eq!(run.exit_code, Some(1));
    assert!(!setup.runs.is_active(&started.run_id));
    let events = setup
        .store
        .list_run_events(&started.run_id, None)
        .expect("events");
    assert!(events
        .iter()
        .any(|event| event.stream == RunStream::Stderr && event.chunk.contains("companion process exited")));

    let workspace = setup
        .store
        .get_workspace(&setup.workspace_id)
        .expect("get")
        .expect("workspace");
    assert_eq!(workspace.status.as_str(), "failed");
}
