// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cross-crate scenarios: the agent dispatch pipeline end to end (classifier
//! → backend → registry), GUI exclusivity through the HTTP surface, and the
//! task-result round trip into a character's pending replies.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use miko_agent::{
    AgentFlags, AgentState, GuiScheduler, PluginRegistry, TaskDeduper, TaskExecutor, TaskRegistry,
    TaskStatus,
};
use miko_config::{CharacterConfig, Config, GuiWorkerConfig};
use miko_gateway::{CharacterRegistry, GatewayState};
use miko_mcp::{Aggregator, ServerStore};
use miko_model::MockChat;
use serde_json::{json, Value};
use tower::ServiceExt;

fn agent_state(
    mock: Arc<MockChat>,
    worker: Option<GuiWorkerConfig>,
    flags: AgentFlags,
    dir: &tempfile::TempDir,
) -> AgentState {
    let store = ServerStore::load(dir.path().join("servers.json"));
    let mcp = Arc::new(Aggregator::new(store));
    let registry = Arc::new(TaskRegistry::new());
    AgentState {
        registry: registry.clone(),
        scheduler: GuiScheduler::spawn(registry, worker, 8),
        executor: Arc::new(TaskExecutor::new(
            mock.clone(),
            mcp,
            PluginRegistry::new(None),
            "http://127.0.0.1:1".into(),
            600,
        )),
        deduper: Arc::new(TaskDeduper::new(mock)),
        flags: Arc::new(StdMutex::new(flags)),
        analyzer_enabled: Arc::new(AtomicBool::new(true)),
    }
}

async fn send(app: &Router, method: &str, path: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// "Set a 5 minute timer" flows through the MCP classifier, executes the
/// chosen tool, and lands as a completed registry entry.
#[tokio::test]
async fn mcp_dispatch_runs_tool_and_records_completion() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockChat::new());
    mock.push_ok(
        json!({
            "has_task": true, "can_execute": true,
            "task_description": "echo the timer request",
            "tool_name": "echo",
            "tool_args": {"message": "Set a 5 minute timer"},
            "reason": "echo can acknowledge"
        })
        .to_string(),
    );
    let flags = AgentFlags {
        mcp_enabled: true,
        computer_use_enabled: false,
        user_plugin_enabled: false,
    };
    let state = agent_state(mock, None, flags, &dir);
    let app = miko_agent::router(state.clone());

    let (status, body) = send(
        &app,
        "POST",
        "/analyze_and_plan",
        json!({
            "messages": [{"role": "user", "text": "Set a 5 minute timer"}],
            "lanlan_name": "momo"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processed");

    // Fire-and-forget: poll the registry for the terminal entry.
    let entry = wait_for_entry(&state, |e| e.status == TaskStatus::Completed).await;
    assert_eq!(entry.result.unwrap()["content"][0]["text"], "Echo: Set a 5 minute timer");
    assert_eq!(entry.lanlan_name.as_deref(), Some("momo"));
}

/// Spec scenario: a GUI task runs exclusively; a second one for the same
/// character is accepted but stays queued until the first finishes.
#[tokio::test]
async fn gui_tasks_run_one_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockChat::new());
    // The second submission consults the dedup judge against the first.
    mock.push_ok(r#"{"duplicate": false, "matched_id": null}"#);
    let worker = Some(GuiWorkerConfig {
        command: "sh".into(),
        args: vec!["-c".into(), "sleep 0.3; echo done".into()],
    });
    let flags = AgentFlags {
        mcp_enabled: false,
        computer_use_enabled: true,
        user_plugin_enabled: false,
    };
    let state = agent_state(mock, worker, flags, &dir);
    let app = miko_agent::router(state.clone());

    let (status, body) = send(
        &app,
        "POST",
        "/computer_use/run",
        json!({"instruction": "Open Chrome", "lanlan_name": "momo"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let first = body["task_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        "POST",
        "/computer_use/run",
        json!({"instruction": "Open the settings panel", "lanlan_name": "momo"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let second = body["task_id"].as_str().unwrap().to_string();

    // While the first runs, the second must still be queued.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(state.registry.get(&first).unwrap().status, TaskStatus::Running);
    assert_eq!(state.registry.get(&second).unwrap().status, TaskStatus::Queued);

    let entry = wait_for_terminal(&state, &second).await;
    assert_eq!(entry.status, TaskStatus::Completed);
    assert_eq!(
        wait_for_terminal(&state, &first).await.status,
        TaskStatus::Completed
    );
}

/// A completed task's summary posted to the main process surfaces in the
/// character's pending replies for the next turn.
#[tokio::test]
async fn task_result_reaches_pending_replies() {
    let registry = CharacterRegistry::new(Arc::new(Config::default()), None);
    registry
        .reload(&[CharacterConfig {
            name: "momo".into(),
            prompt: "You are Momo.".into(),
            voice_id: None,
            model: None,
        }])
        .await;
    let state = GatewayState {
        registry: registry.clone(),
        config: Arc::new(Config::default()),
    };
    let app = miko_gateway::router(state);

    let (status, body) = send(
        &app,
        "POST",
        "/api/notify_task_result",
        json!({"text": "任务已完成: echo the timer request", "lanlan_name": "momo"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let pending = registry.get("momo").unwrap().manager().take_pending_replies();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].contains("已完成"));
    registry.shutdown().await;
}

async fn wait_for_entry(
    state: &AgentState,
    predicate: impl Fn(&miko_agent::TaskEntry) -> bool,
) -> miko_agent::TaskEntry {
    for _ in 0..100 {
        if let Some(entry) = state.registry.snapshot().into_iter().find(|e| predicate(e)) {
            return entry;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no matching registry entry appeared");
}

async fn wait_for_terminal(state: &AgentState, id: &str) -> miko_agent::TaskEntry {
    for _ in 0..150 {
        if let Some(entry) = state.registry.get(id) {
            if entry.status.is_terminal() {
                return entry;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {id} never reached a terminal state");
}
