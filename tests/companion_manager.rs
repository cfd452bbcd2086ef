#![cfg(unix)]

use local_agent_dashboard_lib::companion::{CompanionManager, CompanionState};
use local_agent_dashboard_lib::config::CompanionConfig;
use local_agent_dashboard_lib::errors::AppError;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fixture() -> String {
    format!("{}/tests/fixtures/mock-app-server.sh", env!("CARGO_MANIFEST_DIR"))
}

fn config(mode: &str) -> CompanionConfig {
    CompanionConfig {
        program: "bash".to_string(),
        args: vec![fixture(), mode.to_string()],
        request_timeout_ms: 5_000,
        handshake_timeout_ms: 2_000,
        restart_base_ms: 100,
        restart_max_ms: 400,
        ..CompanionConfig::default()
    }
}

async fn ready_manager() -> CompanionManager {
    let manager = CompanionManager::new(config("normal"));
    manager.start();
    manager
        .wait_ready(Duration::from_secs(5))
        .await
        .expect("companion ready");
    manager
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn handshake_then_request_round_trip() {
    let manager = ready_manager().await;
    let status = manager.status();
    assert_eq!(status.state, CompanionState::Ready);
    assert_eq!(status.generation, 1);
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.pid.is_some());

    let result = manager.request("echo", json!({"value": 1})).await.expect("echo");
    assert_eq!(result, json!({"echoed": true}));
    assert_eq!(manager.pending_request_count(), 0);
    assert!(eventually(|| manager.log_lines().iter().any(|line| line.contains("client initialized"))).await);
}

#[tokio::test]
async fn error_responses_become_protocol_errors() {
    let manager = ready_manager().await;
    match manager.request("fail", json!({})).await {
        Err(AppError::Protocol { code, message, data }) => {
            assert_eq!(code, -32000);
            assert_eq!(message, "mock failure");
            assert_eq!(data, Some(json!({"reason": "requested"})));
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
    assert!(manager.is_ready());
}

#[tokio::test]
async fn timed_out_request_leaves_the_process_usable() {
    let manager = ready_manager().await;
    let outcome = manager
        .request_with_timeout("hang", json!({}), Duration::from_millis(150))
        .await;
    assert!(matches!(outcome, Err(AppError::Timeout { ref method, .. }) if method == "hang"));
    assert_eq!(manager.pending_request_count(), 0);

    let result = manager.request("echo", json!({})).await.expect("echo after timeout");
    assert_eq!(result["echoed"], true);
    assert_eq!(manager.status().generation, 1);
}

#[tokio::test]
async fn later_request_can_resolve_before_an_earlier_one() {
    let manager = ready_manager().await;
    let delayed = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.request("delayed", json!({})).await })
    };
    assert!(eventually(|| manager.pending_request_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!delayed.is_finished());

    let echoed = manager.request("echo", json!({})).await.expect("echo");
    assert_eq!(echoed, json!({"echoed": true}));

    let delayed = delayed.await.expect("join").expect("delayed reply");
    assert_eq!(delayed, json!({"delayed": true}));
    assert_eq!(manager.pending_request_count(), 0);
}

#[tokio::test]
async fn exit_listeners_hear_each_generation_once() {
    let manager = ready_manager().await;
    let exits = Arc::new(Mutex::new(Vec::new()));
    let _subscription = {
        let exits = exits.clone();
        manager.on_exit(move |exit| {
            exits.lock().expect("exits").push(exit.generation);
        })
    };

    manager.notify("exit", json!({}));
    assert!(eventually(|| manager.status().generation == 2 && manager.is_ready()).await);
    assert_eq!(*exits.lock().expect("exits"), vec![1]);
}

#[tokio::test]
async fn child_exit_rejects_every_pending_request_and_restarts_once() {
    let manager = ready_manager().await;
    let mut waiters = Vec::new();
    for _ in 0..3 {
        let manager = manager.clone();
        waiters.push(tokio::spawn(async move { manager.request("hang", json!({})).await }));
    }
    assert!(eventually(|| manager.pending_request_count() == 3).await);

    manager.notify("exit", json!({}));
    for waiter in waiters {
        let outcome = waiter.await.expect("join");
        assert!(matches!(outcome, Err(AppError::ProcessExited(_))), "{:?}", outcome);
    }
    let status = manager.status();
    assert_eq!(status.restarts_scheduled, 1);
    assert_eq!(manager.pending_request_count(), 0);

    manager
        .wait_ready(Duration::from_secs(5))
        .await
        .expect("companion restarted");
    let status = manager.status();
    assert_eq!(status.generation, 2);
    assert_eq!(status.restarts_scheduled, 1);
    assert_eq!(status.consecutive_failures, 0);
}

#[tokio::test]
async fn server_requests_are_refused_and_forwarded() {
    let manager = ready_manager().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _subscription = {
        let seen = seen.clone();
        manager.subscribe(move |message| {
            seen.lock().expect("seen").push(message.clone());
        })
    };

    manager.request("ask", json!({})).await.expect("ask");
    manager.request("emit", json!({})).await.expect("emit");

    let seen = seen.lock().expect("seen").clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].method, "item/commandExecution/requestApproval");
    assert_eq!(seen[0].request_id, Some(json!("srv-1")));
    assert_eq!(seen[1].method, "custom/event");
    assert_eq!(seen[1].request_id, None);
    assert!(eventually(|| manager
        .log_lines()
        .iter()
        .any(|line| line.contains("client rejected server request")))
    .await);
}

#[tokio::test]
async fn dropped_subscription_stops_delivery() {
    let manager = ready_manager().await;
    let count = Arc::new(Mutex::new(0_usize));
    let subscription = {
        let count = count.clone();
        manager.subscribe(move |_| {
            *count.lock().expect("count") += 1;
        })
    };
    manager.request("emit", json!({})).await.expect("emit");
    drop(subscription);
    manager.request("emit", json!({})).await.expect("emit");
    assert_eq!(*count.lock().expect("count"), 1);
}

#[tokio::test]
async fn failed_handshake_enters_error_and_backs_off() {
    let manager = CompanionManager::new(config("fail-init"));
    manager.start();
    assert!(eventually(|| manager.status().state == CompanionState::Error).await);
    let status = manager.status();
    assert!(status.consecutive_failures >= 1);
    assert!(status.last_error.is_some());

    let outcome = manager.request("echo", json!({})).await;
    assert!(matches!(outcome, Err(AppError::Unavailable(_))));
    assert!(manager.wait_ready(Duration::from_millis(200)).await.is_err());

    assert!(eventually(|| manager.status().consecutive_failures >= 2).await);
    assert!(manager
        .log_lines()
        .iter()
        .any(|line| line.contains("refusing to initialize")));
}

#[tokio::test]
async fn silent_handshake_times_out() {
    let mut config = config("no-init");
    config.handshake_timeout_ms = 200;
    let manager = CompanionManager::new(config);
    manager.start();
    let outcome = manager.wait_ready(Duration::from_millis(1_000)).await;
    assert!(matches!(outcome, Err(AppError::Unavailable(_))));
    let status = manager.status();
    assert!(status.generation >= 1);
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("initialize")));
}

#[tokio::test]
async fn second_start_is_a_no_op() {
    let manager = ready_manager().await;
    manager.start();
    assert_eq!(manager.status().generation, 1);
    assert!(manager.is_ready());
}
