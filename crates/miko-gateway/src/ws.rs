// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! User-facing WebSocket endpoint (`/ws/{character}`).
//!
//! JSON text frames carrying `{action, ...}` drive the session manager;
//! outbound frames flow through a per-connection channel so session
//! callbacks never touch the socket directly.  A connection for an unknown
//! character receives a `catgirl_switched` hint before close, and a newer
//! connection for the same character supersedes the older one.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::manager::InputMode;
use crate::GatewayState;

pub async fn ws_handler(
    Path(name): Path<String>,
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, name))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, name: String) {
    let Some(entry) = state.registry.get(&name) else {
        warn!(character = %name, "websocket for unknown character");
        if let Some(current) = state.registry.first_name() {
            let hint = json!({
                "type": "catgirl_switched",
                "new_catgirl": current,
                "old_catgirl": name,
            });
            let _ = socket.send(Message::Text(hint.to_string())).await;
            // Give the client a moment to process the hint before close.
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
        let _ = socket.close().await;
        return;
    };

    let my_id = Uuid::new_v4();
    *entry.session_id.lock().unwrap() = Some(my_id);
    info!(character = %name, session = %my_id, "websocket accepted");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let manager = entry.manager();
    manager.attach_user(tx.clone());

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                let Message::Text(text) = message else { continue };

                // A newer connection for this character wins.
                let superseded = *entry.session_id.lock().unwrap() != Some(my_id);
                if superseded {
                    let _ = socket
                        .send(Message::Text(json!({
                            "type": "status",
                            "message": "切换至另一个终端..."
                        }).to_string()))
                        .await;
                    break;
                }

                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    manager.send_status("invalid JSON frame");
                    continue;
                };
                dispatch_action(&state, &name, frame).await;
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    info!(character = %name, session = %my_id, "websocket cleanup");
    // Only the connection that still owns the character tears the session
    // down; a superseded socket must not kill its successor's session.
    let owns = *entry.session_id.lock().unwrap() == Some(my_id);
    if owns {
        let _guard = entry.ws_lock.lock().await;
        let manager = entry.manager();
        manager.end_session().await;
        manager.detach_user(&tx);
        *entry.session_id.lock().unwrap() = None;
    }
}

async fn dispatch_action(state: &GatewayState, name: &str, frame: Value) {
    let Some(entry) = state.registry.get(name) else {
        return;
    };
    let manager = entry.manager();
    let action = frame["action"].as_str().unwrap_or("");

    match action {
        "start_session" => {
            let input_type = frame["input_type"].as_str().unwrap_or("audio");
            let Some(mode) = InputMode::from_input_type(input_type) else {
                manager.send_status(&format!("Invalid input type: {input_type}"));
                return;
            };
            let new_session = frame["new_session"].as_bool().unwrap_or(false);
            manager.set_idle(false);
            let task_manager = manager.clone();
            tokio::spawn(async move {
                if let Err(e) = task_manager.start_session(new_session, mode).await {
                    warn!(character = %task_manager.name, "session start failed: {e}");
                    task_manager.send_status(&format!("无法开启会话: {e}"));
                }
            });
        }
        "stream_data" => {
            let task_manager = manager.clone();
            tokio::spawn(async move {
                task_manager.stream_data(frame).await;
            });
        }
        "end_session" => {
            manager.set_idle(false);
            let task_manager = manager.clone();
            tokio::spawn(async move {
                task_manager.end_session().await;
            });
        }
        "pause_session" => {
            manager.set_idle(true);
            let task_manager = manager.clone();
            tokio::spawn(async move {
                task_manager.end_session().await;
            });
        }
        "ping" => {
            manager.send_user(json!({ "type": "pong" }));
        }
        other => {
            debug!(action = other, "unknown websocket action");
            manager.send_status(&format!("Unknown action: {other}"));
        }
    }
}
