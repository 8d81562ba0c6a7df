// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Merged tool catalog over every configured upstream.
//!
//! All mutation (connect, reconnect, add/remove server) happens under one
//! async lock; callers read cloned snapshots so `tools/call` never blocks a
//! reconnect and vice versa.  The catalog is never persisted — it is rebuilt
//! from the configured upstream list on every (re)connect.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::local::{call_local, local_tools};
use crate::protocol::{McpError, RpcError, ServerConfig, ToolDescriptor, INVALID_PARAMS};
use crate::store::ServerStore;
use crate::{HttpClient, StdioClient};

pub enum UpstreamClient {
    Http(HttpClient),
    Stdio(StdioClient),
}

impl UpstreamClient {
    pub fn from_config(config: &ServerConfig) -> Self {
        match config {
            ServerConfig::Http { url, api_key } => {
                UpstreamClient::Http(HttpClient::new(url, api_key.clone()))
            }
            ServerConfig::Stdio { command, args } => {
                UpstreamClient::Stdio(StdioClient::new(command.clone(), args.clone()))
            }
        }
    }

    pub fn identifier(&self) -> String {
        match self {
            UpstreamClient::Http(c) => c.identifier(),
            UpstreamClient::Stdio(c) => c.identifier(),
        }
    }

    pub async fn initialize(&self) -> Result<(), McpError> {
        match self {
            UpstreamClient::Http(c) => c.initialize().await,
            UpstreamClient::Stdio(c) => c.initialize().await,
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        match self {
            UpstreamClient::Http(c) => c.list_tools().await,
            UpstreamClient::Stdio(c) => c.list_tools().await,
        }
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        match self {
            UpstreamClient::Http(c) => c.call_tool(name, arguments).await,
            UpstreamClient::Stdio(c) => c.call_tool(name, arguments).await,
        }
    }

    pub async fn close(&self) {
        if let UpstreamClient::Stdio(c) = self {
            c.close().await
        }
        // HTTP clients hold no connection state worth tearing down.
    }
}

#[derive(Default)]
struct AggState {
    tools: Vec<ToolDescriptor>,
    /// tool name → upstream identifier; local tools are absent here.
    routing: HashMap<String, String>,
    clients: HashMap<String, Arc<UpstreamClient>>,
}

pub struct Aggregator {
    store: ServerStore,
    state: Mutex<AggState>,
}

/// Fold one upstream's tools into the catalog.  First-seen wins: a name
/// already claimed (locally or by an earlier upstream) is skipped with a
/// warning, never renamed.
fn merge_tools(
    tools: &mut Vec<ToolDescriptor>,
    routing: &mut HashMap<String, String>,
    upstream_id: &str,
    remote: Vec<ToolDescriptor>,
) -> (usize, usize) {
    let mut added = 0;
    let mut skipped = 0;
    for tool in remote {
        if tool.name.is_empty() {
            continue;
        }
        if tools.iter().any(|t| t.name == tool.name) {
            warn!(tool = %tool.name, upstream = upstream_id, "tool name already claimed, skipping");
            skipped += 1;
            continue;
        }
        routing.insert(tool.name.clone(), upstream_id.to_string());
        tools.push(tool);
        added += 1;
    }
    (added, skipped)
}

impl Aggregator {
    pub fn new(store: ServerStore) -> Self {
        let state = AggState {
            tools: local_tools(),
            ..Default::default()
        };
        Self {
            store,
            state: Mutex::new(state),
        }
    }

    /// Rebuild the catalog from scratch: close everything, re-seed with the
    /// local tools, then initialize and merge each configured upstream in
    /// order.  A failing upstream is logged and skipped; the rest still
    /// connect.
    pub async fn connect_to_remote_servers(&self) {
        let mut state = self.state.lock().await;

        for client in state.clients.values() {
            client.close().await;
        }
        state.clients.clear();
        state.routing.clear();
        state.tools = local_tools();

        let configs = self.store.servers();
        if configs.is_empty() {
            info!("no mcp upstreams configured, serving local tools only");
            return;
        }

        let mut connected = 0usize;
        for config in &configs {
            let identifier = config.identifier();
            let client = Arc::new(UpstreamClient::from_config(config));

            if let Err(e) = client.initialize().await {
                error!(upstream = %identifier, "initialize failed: {e}");
                client.close().await;
                continue;
            }
            let remote = match client.list_tools().await {
                Ok(tools) if !tools.is_empty() => tools,
                Ok(_) => {
                    warn!(upstream = %identifier, "connected but no tools found");
                    client.close().await;
                    continue;
                }
                Err(e) => {
                    error!(upstream = %identifier, "tools/list failed: {e}");
                    client.close().await;
                    continue;
                }
            };

            let AggState { tools, routing, .. } = &mut *state;
            let (added, skipped) = merge_tools(tools, routing, &identifier, remote);
            state.clients.insert(identifier.clone(), client);
            connected += 1;
            info!(upstream = %identifier, added, skipped, "upstream merged");
        }

        info!(
            connected,
            configured = configs.len(),
            total_tools = state.tools.len(),
            "mcp catalog rebuilt"
        );
    }

    /// Snapshot of the merged catalog.
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.state.lock().await.tools.clone()
    }

    pub async fn connected_upstreams(&self) -> Vec<String> {
        self.state.lock().await.clients.keys().cloned().collect()
    }

    pub fn servers(&self) -> Vec<ServerConfig> {
        self.store.servers()
    }

    /// Route a `tools/call`: local tools execute inline, remote tools
    /// forward verbatim, unknown names fail with `UnknownTool`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        if let Some(result) = call_local(name, &arguments) {
            return result.map_err(|msg| {
                McpError::Rpc(RpcError {
                    code: INVALID_PARAMS,
                    message: msg,
                    data: None,
                })
            });
        }

        let client = {
            let state = self.state.lock().await;
            let Some(upstream) = state.routing.get(name) else {
                return Err(McpError::UnknownTool(name.to_string()));
            };
            state
                .clients
                .get(upstream)
                .cloned()
                .ok_or_else(|| McpError::NoClient(upstream.clone()))?
        };
        client.call_tool(name, arguments).await
    }

    /// Persist a new upstream and fold it in via a full reconnect.
    /// Returns `false` when the identifier already exists.
    pub async fn add_server(&self, config: ServerConfig) -> anyhow::Result<bool> {
        if !self.store.add(config)? {
            return Ok(false);
        }
        self.connect_to_remote_servers().await;
        Ok(true)
    }

    /// Remove an upstream: drop it from the persisted list, close its
    /// client, and strip its tools from the catalog in place.
    pub async fn remove_server(&self, identifier: &str) -> anyhow::Result<bool> {
        if !self.store.remove(identifier)? {
            return Ok(false);
        }
        let mut state = self.state.lock().await;
        if let Some(client) = state.clients.remove(identifier) {
            client.close().await;
        }
        let owned: Vec<String> = state
            .routing
            .iter()
            .filter(|(_, v)| v.as_str() == identifier)
            .map(|(k, _)| k.clone())
            .collect();
        for name in &owned {
            state.routing.remove(name);
        }
        state.tools.retain(|t| !owned.contains(&t.name));
        Ok(true)
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for client in state.clients.values() {
            client.close().await;
        }
        state.clients.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: String::new(),
            input_schema: json!({}),
        }
    }

    fn agg() -> Aggregator {
        let dir = tempfile::tempdir().unwrap();
        Aggregator::new(ServerStore::load(dir.path().join("servers.json")))
    }

    #[test]
    fn merge_first_seen_wins() {
        let mut tools = vec![tool("echo")];
        let mut routing = HashMap::new();

        let (added, skipped) = merge_tools(
            &mut tools,
            &mut routing,
            "up1",
            vec![tool("echo"), tool("timer")],
        );
        assert_eq!((added, skipped), (1, 1));

        let (added, skipped) = merge_tools(&mut tools, &mut routing, "up2", vec![tool("timer")]);
        assert_eq!((added, skipped), (0, 1));

        assert_eq!(routing.get("timer").map(String::as_str), Some("up1"));
        assert_eq!(tools.len(), 2);
    }

    #[test]
    fn merge_skips_empty_names() {
        let mut tools = Vec::new();
        let mut routing = HashMap::new();
        let (added, _) = merge_tools(&mut tools, &mut routing, "up", vec![tool("")]);
        assert_eq!(added, 0);
    }

    #[tokio::test]
    async fn fresh_aggregator_serves_local_tools() {
        let a = agg();
        let names: Vec<String> = a.tools().await.into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"echo".to_string()));
        assert!(names.contains(&"add".to_string()));
        assert!(names.contains(&"get_time".to_string()));
    }

    #[tokio::test]
    async fn local_tool_executes_inline() {
        let a = agg();
        let r = a.call_tool("echo", json!({"message": "ping"})).await.unwrap();
        assert_eq!(r["content"][0]["text"], "Echo: ping");
    }

    #[tokio::test]
    async fn local_tool_bad_args_is_invalid_params() {
        let a = agg();
        let err = a.call_tool("add", json!({"a": 1})).await.unwrap_err();
        match err {
            McpError::Rpc(e) => assert_eq!(e.code, INVALID_PARAMS),
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let a = agg();
        let err = a.call_tool("no_such_tool", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn reconnect_with_no_upstreams_keeps_local_catalog() {
        let a = agg();
        a.connect_to_remote_servers().await;
        assert_eq!(a.tools().await.len(), local_tools().len());
        assert!(a.connected_upstreams().await.is_empty());
    }

    #[tokio::test]
    async fn remove_unknown_server_is_false() {
        let a = agg();
        assert!(!a.remove_server("https://nope/mcp").await.unwrap());
    }
}
