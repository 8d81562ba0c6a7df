// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Main-process surface.
//!
//! Hosts the per-character realtime sessions behind the user WebSocket
//! (`/ws/{character}`), the character registry with its hot-reload
//! discipline, the monitor sync connectors, and the small HTTP API the
//! agent process calls back into.

mod http;
mod manager;
mod registry;
mod sync;
mod ws;

pub use manager::{InputMode, SessionManager, Turn};
pub use registry::{CharacterEntry, CharacterRegistry};
pub use sync::{join_with_timeout, spawn_sync_connector};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::{get, post, put};
use axum::Router;
use miko_config::Config;
use miko_model::{ChatModel, OpenAiChat};
use tracing::info;

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<CharacterRegistry>,
    pub config: Arc<Config>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/:lanlan_name", get(ws::ws_handler))
        .route("/api/notify_task_result", post(http::notify_task_result))
        .route("/api/reload_characters", post(http::reload_characters))
        .route(
            "/api/characters/voice_id/:name",
            put(http::update_voice),
        )
        .route("/api/health", get(http::health))
        .with_state(state)
}

/// Run the main process: load characters, spawn their sync connectors, and
/// serve the WebSocket + HTTP surface on the main port.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let vision: Option<Arc<dyn ChatModel>> = config.vision.as_ref().map(|v| {
        let api_key = v
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                v.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            });
        Arc::new(OpenAiChat::new(&v.base_url, v.model.clone(), api_key)) as Arc<dyn ChatModel>
    });

    let registry = CharacterRegistry::new(config.clone(), vision);
    registry.reload(&config.characters).await;
    info!(characters = ?registry.names(), "character registry initialized");

    let state = GatewayState {
        registry: registry.clone(),
        config: config.clone(),
    };
    let app = router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.ports.main));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding main server to {addr}"))?;
    info!(%addr, "main server listening");

    axum::serve(listener, app).await.context("main server exited")?;

    registry.shutdown().await;
    Ok(())
}
