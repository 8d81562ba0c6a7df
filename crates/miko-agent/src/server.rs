// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent-process HTTP API.
//!
//! Localhost-only surface consumed by the main process (and the local admin
//! UI): task submission with LLM-based dedup, the fire-and-forget
//! conversation analyzer, feature flags, registry inspection, and the
//! GUI-automation queue.  The MCP aggregation router is merged in by
//! [`crate::run`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::dedup::TaskDeduper;
use crate::executor::{AgentFlags, ChatTurn, TaskExecutor, TaskResult};
use crate::registry::{TaskEntry, TaskKind, TaskRegistry};
use crate::scheduler::{EnqueueError, GuiScheduler, GuiTask};

#[derive(Clone)]
pub struct AgentState {
    pub registry: Arc<TaskRegistry>,
    pub scheduler: Arc<GuiScheduler>,
    pub executor: Arc<TaskExecutor>,
    pub deduper: Arc<TaskDeduper>,
    pub flags: Arc<StdMutex<AgentFlags>>,
    pub analyzer_enabled: Arc<AtomicBool>,
}

impl AgentState {
    fn flags(&self) -> AgentFlags {
        *self.flags.lock().unwrap()
    }
}

pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/process", post(process))
        .route("/plan", post(plan))
        .route("/analyze_and_plan", post(analyze_and_plan))
        .route("/agent/flags", get(get_flags).post(set_flags))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/capabilities", get(capabilities))
        .route("/mcp/availability", get(mcp_availability))
        .route("/computer_use/availability", get(computer_use_availability))
        .route("/computer_use/run", post(computer_use_run))
        .route("/admin/control", post(admin_control))
        .with_state(state)
}

fn conflict(matched_id: Option<String>) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "success": false,
            "error": "duplicate task",
            "matched_task_id": matched_id,
        })),
    )
        .into_response()
}

/// LLM dedup against the character's queued/running tasks.
async fn duplicate_of(state: &AgentState, query: &str, lanlan_name: Option<&str>) -> Option<String> {
    let candidates = state.registry.active_descriptions(lanlan_name);
    let verdict = state.deduper.judge(query, &candidates).await;
    if verdict.duplicate {
        Some(verdict.matched_id.unwrap_or_default())
    } else {
        None
    }
}

/// Fold one dispatch outcome into the registry; a GUI acceptance becomes a
/// queued entry on the exclusivity scheduler.
fn record_outcome(state: &AgentState, result: &TaskResult, lanlan_name: Option<&str>) {
    match result.execution_method.as_str() {
        "gui_auto" => {
            let entry = TaskEntry::queued(
                &result.task_id,
                TaskKind::GuiAuto,
                json!({ "instruction": result.task_description }),
                lanlan_name.map(String::from),
            );
            state.registry.insert(entry);
            let task = GuiTask {
                task_id: result.task_id.clone(),
                instruction: result.task_description.clone(),
            };
            if let Err(EnqueueError::QueueFull) = state.scheduler.enqueue(task) {
                state.registry.fail(&result.task_id, "gui task queue full");
            }
        }
        "mcp" | "user_plugin" => {
            let kind = if result.execution_method == "mcp" {
                TaskKind::Mcp
            } else {
                TaskKind::Plugin
            };
            let mut entry = TaskEntry::queued(
                &result.task_id,
                kind,
                json!({ "query": result.task_description }),
                lanlan_name.map(String::from),
            );
            entry.tool_invocation(result);
            state.registry.insert(entry);
            if result.success {
                state
                    .registry
                    .complete(&result.task_id, result.result.clone().unwrap_or(json!({})));
            } else {
                state.registry.fail(
                    &result.task_id,
                    result.error.clone().unwrap_or_else(|| result.reason.clone()),
                );
            }
        }
        _ => {
            info!(reason = %result.reason, "task detected but not executable");
        }
    }
}

impl TaskEntry {
    /// Attach the tool call details from a dispatch result.
    fn tool_invocation(&mut self, result: &TaskResult) {
        self.params = json!({
            "query": result.task_description,
            "tool_name": result.tool_name,
            "tool_args": result.tool_args,
        });
    }
}

// ─── Task submission ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ProcessRequest {
    query: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    lanlan_name: Option<String>,
}

async fn submit_query(state: AgentState, req: ProcessRequest) -> Response {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "query required"})),
        )
            .into_response();
    }
    if let Some(matched) = duplicate_of(&state, &req.query, req.lanlan_name.as_deref()).await {
        return conflict(Some(matched));
    }

    let task_id = req.task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let entry = TaskEntry::queued(
        &task_id,
        TaskKind::Mcp,
        json!({ "query": req.query }),
        req.lanlan_name.clone(),
    );
    let start_time = entry.start_time;
    state.registry.insert(entry);

    let messages = vec![ChatTurn {
        role: "user".into(),
        text: req.query.clone(),
    }];
    let dispatch_state = state.clone();
    let dispatch_id = task_id.clone();
    tokio::spawn(async move {
        dispatch_tracked(dispatch_state, dispatch_id, messages, req.lanlan_name).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": task_id,
            "status": "queued",
            "start_time": start_time,
        })),
    )
        .into_response()
}

/// Drive one tracked dispatch to a terminal registry state.
async fn dispatch_tracked(
    state: AgentState,
    task_id: String,
    messages: Vec<ChatTurn>,
    lanlan_name: Option<String>,
) {
    state.registry.set_running(&task_id);
    let flags = state.flags();
    let outcome = state
        .executor
        .analyze_and_execute(
            &messages,
            lanlan_name.as_deref(),
            flags,
            state.scheduler.is_ready(),
        )
        .await;

    match outcome {
        Some(result) if result.execution_method == "gui_auto" => {
            // The GUI work continues under its own registry entry.
            record_outcome(&state, &result, lanlan_name.as_deref());
            state
                .registry
                .complete(&task_id, json!({ "delegated_to": result.task_id }));
        }
        Some(result) if result.success => {
            state
                .registry
                .complete(&task_id, serde_json::to_value(&result).unwrap_or(json!({})));
        }
        Some(result) => {
            state.registry.fail(
                &task_id,
                result.error.unwrap_or_else(|| result.reason.clone()),
            );
        }
        None => {
            state.registry.complete(&task_id, json!({ "has_task": false }));
        }
    }
}

async fn process(State(state): State<AgentState>, Json(mut req): Json<ProcessRequest>) -> Response {
    req.task_id = None;
    submit_query(state, req).await
}

async fn plan(State(state): State<AgentState>, Json(req): Json<ProcessRequest>) -> Response {
    submit_query(state, req).await
}

// ─── Conversation analyzer ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct AnalyzeRequest {
    #[serde(default)]
    messages: Vec<ChatTurn>,
    #[serde(default)]
    lanlan_name: Option<String>,
}

/// Fire-and-forget: assess the conversation window and execute or queue at
/// most one task.  The caller never waits on classification.
async fn analyze_and_plan(
    State(state): State<AgentState>,
    Json(req): Json<AnalyzeRequest>,
) -> Json<Value> {
    if !state.analyzer_enabled.load(Ordering::SeqCst) {
        return Json(json!({"status": "disabled"}));
    }

    let task_state = state.clone();
    tokio::spawn(async move {
        let flags = task_state.flags();
        let outcome = task_state
            .executor
            .analyze_and_execute(
                &req.messages,
                req.lanlan_name.as_deref(),
                flags,
                task_state.scheduler.is_ready(),
            )
            .await;
        if let Some(result) = outcome {
            record_outcome(&task_state, &result, req.lanlan_name.as_deref());
        }
    });

    Json(json!({"status": "processed"}))
}

// ─── Flags, registry, availability ───────────────────────────────────────────

async fn get_flags(State(state): State<AgentState>) -> Json<AgentFlags> {
    Json(state.flags())
}

#[derive(Deserialize)]
struct FlagsUpdate {
    mcp_enabled: Option<bool>,
    computer_use_enabled: Option<bool>,
    user_plugin_enabled: Option<bool>,
}

async fn set_flags(
    State(state): State<AgentState>,
    Json(update): Json<FlagsUpdate>,
) -> Json<AgentFlags> {
    let mut flags = state.flags.lock().unwrap();
    if let Some(v) = update.mcp_enabled {
        flags.mcp_enabled = v;
    }
    if let Some(v) = update.computer_use_enabled {
        flags.computer_use_enabled = v;
    }
    if let Some(v) = update.user_plugin_enabled {
        flags.user_plugin_enabled = v;
    }
    info!(?flags, "agent flags updated");
    Json(*flags)
}

async fn list_tasks(State(state): State<AgentState>) -> Json<Value> {
    let tasks: HashMap<String, TaskEntry> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect();
    Json(json!({ "tasks": tasks }))
}

async fn get_task(State(state): State<AgentState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(entry) => Json(entry).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "task not found"})),
        )
            .into_response(),
    }
}

async fn capabilities(State(state): State<AgentState>) -> Json<Value> {
    let map = state.executor.capability_map(false).await;
    Json(json!(map))
}

async fn mcp_availability(State(state): State<AgentState>) -> Json<Value> {
    let tools = state.executor.capabilities(false).await;
    Json(json!({
        "available": !tools.is_empty(),
        "tools_count": tools.len(),
    }))
}

async fn computer_use_availability(State(state): State<AgentState>) -> Json<Value> {
    Json(json!({
        "available": state.scheduler.is_ready(),
        "active_task": state.scheduler.active_task(),
        "queued": state.scheduler.queue_len(),
    }))
}

// ─── GUI task submission ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ComputerUseRequest {
    instruction: String,
    #[serde(default)]
    lanlan_name: Option<String>,
}

async fn computer_use_run(
    State(state): State<AgentState>,
    Json(req): Json<ComputerUseRequest>,
) -> Response {
    if req.instruction.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "instruction required"})),
        )
            .into_response();
    }
    if let Some(matched) = duplicate_of(&state, &req.instruction, req.lanlan_name.as_deref()).await
    {
        return conflict(Some(matched));
    }

    let task_id = Uuid::new_v4().to_string();
    let entry = TaskEntry::queued(
        &task_id,
        TaskKind::GuiAuto,
        json!({ "instruction": req.instruction }),
        req.lanlan_name,
    );
    let start_time = entry.start_time;
    state.registry.insert(entry);

    let task = GuiTask {
        task_id: task_id.clone(),
        instruction: req.instruction,
    };
    if let Err(EnqueueError::QueueFull) = state.scheduler.enqueue(task) {
        state.registry.fail(&task_id, "gui task queue full");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"success": false, "error": "gui task queue full"})),
        )
            .into_response();
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": task_id,
            "status": "queued",
            "start_time": start_time,
        })),
    )
        .into_response()
}

// ─── Admin ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ControlRequest {
    action: String,
}

async fn admin_control(
    State(state): State<AgentState>,
    Json(req): Json<ControlRequest>,
) -> Response {
    match req.action.as_str() {
        "end_all" => {
            let queued = state.scheduler.end_all();
            let failed = state.registry.fail_all_active("cancelled by admin");
            warn!(queued, failed, "administrative reset");
            Json(json!({"success": true, "cancelled": failed})).into_response()
        }
        "enable_analyzer" => {
            state.analyzer_enabled.store(true, Ordering::SeqCst);
            Json(json!({"success": true, "analyzer_enabled": true})).into_response()
        }
        "disable_analyzer" => {
            state.analyzer_enabled.store(false, Ordering::SeqCst);
            Json(json!({"success": true, "analyzer_enabled": false})).into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": format!("unknown action: {other}")})),
        )
            .into_response(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use miko_mcp::{Aggregator, ServerStore};
    use miko_model::MockChat;
    use tower::ServiceExt;

    fn test_state(mock: Arc<MockChat>, dir: &tempfile::TempDir) -> AgentState {
        let store = ServerStore::load(dir.path().join("servers.json"));
        let mcp = Arc::new(Aggregator::new(store));
        let registry = Arc::new(TaskRegistry::new());
        let executor = Arc::new(TaskExecutor::new(
            mock.clone(),
            mcp,
            PluginRegistry::new(None),
            "http://127.0.0.1:1".into(),
            600,
        ));
        AgentState {
            registry: registry.clone(),
            scheduler: GuiScheduler::spawn(registry, None, 8),
            executor,
            deduper: Arc::new(TaskDeduper::new(mock)),
            flags: Arc::new(StdMutex::new(AgentFlags {
                mcp_enabled: false,
                computer_use_enabled: false,
                user_plugin_enabled: false,
            })),
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
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn flags_partial_update_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(Arc::new(MockChat::new()), &dir));

        let (_, body) = send(&app, "POST", "/agent/flags", json!({"mcp_enabled": true})).await;
        assert_eq!(body["mcp_enabled"], true);
        assert_eq!(body["computer_use_enabled"], false);

        let (_, body) = send(&app, "GET", "/agent/flags", json!({})).await;
        assert_eq!(body["mcp_enabled"], true);
    }

    #[tokio::test]
    async fn tasks_listing_starts_empty_and_404_on_missing() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(Arc::new(MockChat::new()), &dir));

        let (status, body) = send(&app, "GET", "/tasks", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["tasks"].as_object().unwrap().is_empty());

        let (status, _) = send(&app, "GET", "/tasks/nope", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn computer_use_run_queues_then_conflicts_on_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChat::new());
        // Second submission: dedup judge sees the first task and matches it.
        mock.push_ok(r#"{"duplicate": true, "matched_id": "will-be-replaced"}"#);
        let state = test_state(mock, &dir);
        let app = router(state.clone());

        let (status, body) = send(
            &app,
            "POST",
            "/computer_use/run",
            json!({"instruction": "Open Chrome", "lanlan_name": "momo"}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let first_id = body["task_id"].as_str().unwrap().to_string();
        assert_eq!(body["status"], "queued");
        assert_eq!(state.registry.get(&first_id).unwrap().kind, TaskKind::GuiAuto);

        let (status, body) = send(
            &app,
            "POST",
            "/computer_use/run",
            json!({"instruction": "open chrome please", "lanlan_name": "momo"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "duplicate task");
    }

    #[tokio::test]
    async fn computer_use_run_rejects_empty_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(Arc::new(MockChat::new()), &dir));
        let (status, _) = send(&app, "POST", "/computer_use/run", json!({"instruction": " "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn capabilities_and_availability_reflect_local_tools() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(Arc::new(MockChat::new()), &dir));

        let (_, body) = send(&app, "GET", "/capabilities", json!({})).await;
        assert_eq!(body["echo"]["type"], "mcp_tool");

        let (_, body) = send(&app, "GET", "/mcp/availability", json!({})).await;
        assert_eq!(body["available"], true);

        let (_, body) = send(&app, "GET", "/computer_use/availability", json!({})).await;
        assert_eq!(body["available"], false);
    }

    #[tokio::test]
    async fn analyze_and_plan_respects_analyzer_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(Arc::new(MockChat::new()), &dir);
        let app = router(state.clone());

        let (_, body) = send(
            &app,
            "POST",
            "/analyze_and_plan",
            json!({"messages": [{"role": "user", "text": "hi"}]}),
        )
        .await;
        assert_eq!(body["status"], "processed");

        let (_, _) = send(&app, "POST", "/admin/control", json!({"action": "disable_analyzer"})).await;
        let (_, body) = send(
            &app,
            "POST",
            "/analyze_and_plan",
            json!({"messages": [{"role": "user", "text": "hi"}]}),
        )
        .await;
        assert_eq!(body["status"], "disabled");
    }

    #[tokio::test]
    async fn process_accepts_and_tracks_task() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(Arc::new(MockChat::new()), &dir);
        let app = router(state.clone());

        let (status, body) = send(
            &app,
            "POST",
            "/process",
            json!({"query": "set a timer", "lanlan_name": "momo"}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = body["task_id"].as_str().unwrap().to_string();

        // All backends disabled: the dispatch resolves to "no task".
        for _ in 0..50 {
            if state
                .registry
                .get(&task_id)
                .map(|e| e.status.is_terminal())
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let entry = state.registry.get(&task_id).unwrap();
        assert!(entry.status.is_terminal());
        assert_eq!(entry.result.unwrap()["has_task"], false);
    }

    #[tokio::test]
    async fn admin_control_unknown_action_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(Arc::new(MockChat::new()), &dir));
        let (status, _) = send(&app, "POST", "/admin/control", json!({"action": "reboot"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_end_all_cancels_queued_gui_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(Arc::new(MockChat::new()), &dir);
        let app = router(state.clone());

        let (_, body) = send(
            &app,
            "POST",
            "/computer_use/run",
            json!({"instruction": "Open Chrome"}),
        )
        .await;
        let task_id = body["task_id"].as_str().unwrap().to_string();

        let (status, _) = send(&app, "POST", "/admin/control", json!({"action": "end_all"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            state.registry.get(&task_id).unwrap().status,
            crate::registry::TaskStatus::Failed
        );
    }
}
