//! Lifecycle coverage against the real `htp-worker` binary: lazy launch,
//! idempotency under racing dispatches, halt/relaunch and idle self-exit.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use serial_test::serial;

use htp::connector::ProcessConnector;
use htp::{
    Backend, ConnectionState, Engine, EngineConfig, ExecutionOutcome, ExecutionRequest,
    TaskRegistry, WorkUnit,
};

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_htp-worker");
const TOKEN: &str = "spawn-test-token";
const WORKER_NODE: &str = "htp_worker_spawn@localhost";

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe socket");
    listener.local_addr().expect("local addr").port()
}

fn engine_for(port: u16, idle: Duration) -> Engine {
    let config = EngineConfig::new("spawn@localhost")
        .with_token(TOKEN)
        .with_worker_port(port)
        .with_worker_program(WORKER_BIN)
        .with_idle_timeout(idle)
        .with_connect_budget(Duration::from_secs(3));
    Engine::new(config, Arc::new(TaskRegistry::new()))
}

fn echo(input: serde_json::Value) -> ExecutionRequest {
    ExecutionRequest::new(
        WorkUnit::new("echo", input),
        Some(Duration::from_secs(3)),
        Backend::OutOfProcess,
    )
}

async fn wait_unreachable(port: u16) {
    let connector = ProcessConnector::new(port, TOKEN, WORKER_NODE, Duration::from_millis(100));
    for _ in 0..30 {
        if !connector.probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("worker on port {port} never became unreachable");
}

#[tokio::test]
#[serial]
async fn lazy_launch_halt_and_relaunch() {
    let port = free_port();
    let engine = engine_for(port, Duration::from_secs(30));

    // first dispatch launches the helper lazily
    let outcome = engine.execute(echo(json!({ "n": 7 }))).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed(json!({ "n": 7 })));
    assert_eq!(engine.connection_state().await, ConnectionState::Connected);

    engine.halt_worker().await.unwrap();
    assert_eq!(engine.connection_state().await, ConnectionState::Disconnected);
    wait_unreachable(port).await;

    // next dispatch runs the whole disconnected -> connecting -> connected
    // cycle again with a fresh helper
    let outcome = engine.execute(echo(json!("again"))).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed(json!("again")));
    assert_eq!(engine.connection_state().await, ConnectionState::Connected);

    engine.halt_worker().await.unwrap();
    wait_unreachable(port).await;
}

#[tokio::test]
#[serial]
async fn racing_dispatches_converge_on_one_helper() {
    let port = free_port();
    let engine = Arc::new(engine_for(port, Duration::from_secs(30)));

    let mut calls = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        calls.push(tokio::spawn(async move {
            engine.execute(echo(json!(i))).await
        }));
    }
    for (i, call) in calls.into_iter().enumerate() {
        let outcome = call.await.expect("dispatch task").unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed(json!(i)));
    }

    // one halt terminates the single helper all dispatches shared
    engine.halt_worker().await.unwrap();
    wait_unreachable(port).await;
}

#[tokio::test]
#[serial]
async fn helper_self_terminates_after_the_idle_bound() {
    let port = free_port();
    let engine = engine_for(port, Duration::from_millis(1000));

    let outcome = engine.execute(echo(json!(1))).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed(json!(1)));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    wait_unreachable(port).await;
}

#[tokio::test]
#[serial]
async fn remote_failure_comes_back_as_exit() {
    let port = free_port();
    let engine = engine_for(port, Duration::from_secs(30));

    let request = ExecutionRequest::new(
        WorkUnit::new("fail", json!({ "reason": "native library aborted" })),
        Some(Duration::from_secs(3)),
        Backend::OutOfProcess,
    );
    match engine.execute(request).await.unwrap() {
        ExecutionOutcome::Exited(reason) => assert!(reason.contains("native library aborted")),
        other => panic!("expected Exited, got {other:?}"),
    }

    engine.halt_worker().await.unwrap();
    wait_unreachable(port).await;
}
