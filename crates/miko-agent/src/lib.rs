// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent dispatch core.
//!
//! Watches the conversation (via `/analyze_and_plan` from the main process),
//! decides whether an actionable task is present, and routes it to exactly
//! one backend: an MCP tool, the GUI-automation worker, or a user-defined
//! HTTP plugin.  Priority when several would accept: MCP > GUI > plugin.
//! The MCP aggregation core runs inside this process and its router is
//! mounted on the same localhost listener.

mod decision;
mod dedup;
mod executor;
mod plugins;
mod registry;
mod scheduler;
mod server;

pub use decision::{parse_decision, GuiDecision, McpDecision, PluginDecision};
pub use dedup::{DedupVerdict, TaskDeduper};
pub use executor::{AgentFlags, ChatTurn, TaskExecutor, TaskResult};
pub use plugins::{describe_plugins, PluginEntry, PluginRegistry};
pub use registry::{TaskEntry, TaskKind, TaskRegistry, TaskStatus};
pub use scheduler::{EnqueueError, GuiScheduler, GuiTask};
pub use server::{router, AgentState};

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use miko_config::Config;
use miko_model::{ChatModel, OpenAiChat};
use tracing::info;

/// Run the agent process: build the aggregator, dispatcher, and scheduler,
/// then serve the combined agent + MCP router on the localhost agent port.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let model: Arc<dyn ChatModel> = Arc::new(OpenAiChat::new(
        &config.classifier.base_url,
        config.classifier.model.clone(),
        config.classifier.resolve_api_key(),
    ));

    let store = miko_mcp::ServerStore::load(&config.agent.mcp_servers_file);
    let aggregator = Arc::new(miko_mcp::Aggregator::new(store));
    aggregator.connect_to_remote_servers().await;

    let registry = Arc::new(TaskRegistry::new());
    let scheduler = GuiScheduler::spawn(
        registry.clone(),
        config.agent.gui_worker.clone(),
        config.agent.gui_queue_limit,
    );
    let executor = Arc::new(TaskExecutor::new(
        model.clone(),
        aggregator.clone(),
        PluginRegistry::new(config.agent.plugin_server_url.clone()),
        config.ports.main_url(),
        config.classifier.max_tokens,
    ));

    let state = AgentState {
        registry,
        scheduler,
        executor,
        deduper: Arc::new(TaskDeduper::new(model)),
        flags: Arc::new(StdMutex::new(AgentFlags::from_config(&config.agent))),
        analyzer_enabled: Arc::new(AtomicBool::new(config.agent.analyzer_enabled)),
    };

    let app = router(state)
        .merge(miko_mcp::router(aggregator.clone()))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.ports.agent));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding agent server to {addr}"))?;
    info!(%addr, "agent server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("agent server exited")?;

    aggregator.shutdown().await;
    Ok(())
}
