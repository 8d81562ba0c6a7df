// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Main-process HTTP API.
//!
//! `/api/notify_task_result` is the agent's one road back into the
//! conversation: the text is queued on the character's session manager and
//! spoken after the next completed turn.  `/api/reload_characters` and the
//! voice endpoint are the hot-reload triggers used by the external CRUD
//! surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miko_config::CharacterConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::GatewayState;

#[derive(Deserialize)]
pub struct NotifyRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub lanlan_name: Option<String>,
}

/// Queue a task-result notice for the character's next turn.
pub async fn notify_task_result(
    State(state): State<GatewayState>,
    Json(req): Json<NotifyRequest>,
) -> Response {
    let text = req.text.trim().to_string();
    if text.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "text required"})),
        )
            .into_response();
    }

    let name = req
        .lanlan_name
        .or_else(|| state.registry.first_name())
        .unwrap_or_default();
    let Some(entry) = state.registry.get(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "lanlan not found"})),
        )
            .into_response();
    };

    info!(character = %name, "queued task result for next turn");
    entry.manager().push_extra_reply(text);
    Json(json!({"success": true})).into_response()
}

#[derive(Deserialize)]
pub struct ReloadRequest {
    #[serde(default)]
    pub characters: Option<Vec<CharacterConfig>>,
}

/// Hot-reload trigger.  With a character list in the body that list is
/// applied; without one, configuration is re-read from disk.
pub async fn reload_characters(
    State(state): State<GatewayState>,
    Json(req): Json<ReloadRequest>,
) -> Response {
    let characters = match req.characters {
        Some(list) => list,
        None => match miko_config::load(None) {
            Ok(config) => config.characters,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"success": false, "error": e.to_string()})),
                )
                    .into_response();
            }
        },
    };

    state.registry.reload(&characters).await;
    Json(json!({
        "success": true,
        "characters": state.registry.names(),
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct VoiceRequest {
    #[serde(default)]
    pub voice_id: Option<String>,
}

/// Voice change for one character.  For the connected character this walks
/// the reload-page → close-session → rebuild order so the frontend
/// reconnects cleanly with the new voice.
pub async fn update_voice(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    Json(req): Json<VoiceRequest>,
) -> Response {
    let restarted = state
        .registry
        .get(&name)
        .map(|e| e.manager().is_active())
        .unwrap_or(false);
    if !state.registry.apply_voice_change(&name, req.voice_id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "character not found"})),
        )
            .into_response();
    }
    Json(json!({"success": true, "session_restarted": restarted})).into_response()
}

pub async fn health(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "characters": state.registry.names(),
    }))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CharacterRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use miko_config::Config;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state(names: &[&str]) -> GatewayState {
        let registry = CharacterRegistry::new(Arc::new(Config::default()), None);
        let characters: Vec<CharacterConfig> = names
            .iter()
            .map(|n| CharacterConfig {
                name: n.to_string(),
                prompt: format!("You are {n}."),
                voice_id: None,
                model: None,
            })
            .collect();
        registry.reload(&characters).await;
        GatewayState {
            registry,
            config: Arc::new(Config::default()),
        }
    }

    async fn send(
        state: GatewayState,
        method: &str,
        path: &str,
        body: Value,
    ) -> (StatusCode, Value) {
        let app = crate::router(state);
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn notify_requires_text() {
        let state = test_state(&["momo"]).await;
        let (status, _) = send(
            state.clone(),
            "POST",
            "/api/notify_task_result",
            json!({"text": "  ", "lanlan_name": "momo"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn notify_unknown_character_is_404() {
        let state = test_state(&["momo"]).await;
        let (status, _) = send(
            state.clone(),
            "POST",
            "/api/notify_task_result",
            json!({"text": "任务已完成", "lanlan_name": "ghost"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn notify_appends_to_pending_replies() {
        let state = test_state(&["momo"]).await;
        let (status, body) = send(
            state.clone(),
            "POST",
            "/api/notify_task_result",
            json!({"text": "任务已完成: 定时器", "lanlan_name": "momo"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let manager = state.registry.get("momo").unwrap().manager();
        let pending = manager.take_pending_replies();
        assert_eq!(pending, vec!["任务已完成: 定时器"]);
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn notify_defaults_to_first_character() {
        let state = test_state(&["momo", "yuki"]).await;
        let (status, _) = send(
            state.clone(),
            "POST",
            "/api/notify_task_result",
            json!({"text": "任务已完成"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let manager = state.registry.get("momo").unwrap().manager();
        assert_eq!(manager.take_pending_replies().len(), 1);
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn reload_applies_character_list() {
        let state = test_state(&["momo"]).await;
        let (status, body) = send(
            state.clone(),
            "POST",
            "/api/reload_characters",
            json!({"characters": [
                {"name": "momo", "prompt": "updated"},
                {"name": "yuki", "prompt": "new"}
            ]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["characters"], json!(["momo", "yuki"]));
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn voice_update_unknown_character_is_404() {
        let state = test_state(&["momo"]).await;
        let (status, _) = send(
            state.clone(),
            "PUT",
            "/api/characters/voice_id/ghost",
            json!({"voice_id": "v1"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn voice_update_sets_voice() {
        let state = test_state(&["momo"]).await;
        let (status, body) = send(
            state.clone(),
            "PUT",
            "/api/characters/voice_id/momo",
            json!({"voice_id": "v1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_restarted"], false);
        let manager = state.registry.get("momo").unwrap().manager();
        assert_eq!(manager.voice_id().as_deref(), Some("v1"));
        state.registry.shutdown().await;
    }
}
