// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Serving side of the aggregator: the MCP JSON-RPC endpoint plus the
//! localhost-only admin API for mutating the upstream list.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::protocol::{
    error_response, success_response, McpError, ServerConfig, INTERNAL_ERROR, INVALID_PARAMS,
    INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};

pub fn router(agg: Arc<Aggregator>) -> Router {
    let admin = Router::new()
        .route(
            "/api/servers",
            get(list_servers).post(add_server).delete(delete_server),
        )
        .route("/api/servers/import", post(import_servers))
        .route("/api/reconnect", post(reconnect))
        .layer(middleware::from_fn(require_local));

    Router::new()
        .route("/mcp", post(mcp_endpoint))
        .route("/health", get(health))
        .merge(admin)
        .with_state(agg)
}

/// Admin mutations are only accepted from loopback peers.
async fn require_local(req: Request, next: Next) -> Response {
    let is_local = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().is_loopback())
        .unwrap_or(false);
    if !is_local {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Admin access required. Only localhost requests are allowed."})),
        )
            .into_response();
    }
    next.run(req).await
}

// ─── MCP endpoint ────────────────────────────────────────────────────────────

async fn mcp_endpoint(State(agg): State<Arc<Aggregator>>, body: String) -> Response {
    let request: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_response(
                    Value::Null,
                    PARSE_ERROR,
                    "Parse error",
                    Some(json!("Invalid JSON")),
                )),
            )
                .into_response();
        }
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if request["jsonrpc"] != "2.0" {
        return (
            StatusCode::BAD_REQUEST,
            Json(error_response(
                id,
                INVALID_REQUEST,
                "Invalid Request",
                Some(json!("jsonrpc must be '2.0'")),
            )),
        )
            .into_response();
    }

    let Some(method) = request["method"].as_str().filter(|m| !m.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(error_response(
                id,
                INVALID_REQUEST,
                "Invalid Request",
                Some(json!("method is required")),
            )),
        )
            .into_response();
    };
    let params = request.get("params").cloned().unwrap_or(json!({}));

    // Notifications carry no id and expect no response body.
    if method.starts_with("notifications/") {
        return StatusCode::ACCEPTED.into_response();
    }

    match method {
        "initialize" => {
            let client = params["clientInfo"]["name"].as_str().unwrap_or("unknown");
            info!(client, "mcp initialize request");
            let result = json!({
                "protocolVersion": params["protocolVersion"].as_str().unwrap_or(PROTOCOL_VERSION),
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "miko-mcp", "version": "0.3.0" }
            });
            Json(success_response(id, result)).into_response()
        }
        "tools/list" => {
            let tools = agg.tools().await;
            Json(success_response(id, json!({ "tools": tools }))).into_response()
        }
        "tools/call" => {
            let Some(name) = params["name"].as_str().filter(|n| !n.is_empty()) else {
                return Json(error_response(
                    id,
                    INVALID_PARAMS,
                    "Invalid params",
                    Some(json!("Tool name is required")),
                ))
                .into_response();
            };
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            match agg.call_tool(name, arguments).await {
                Ok(result) => Json(success_response(id, result)).into_response(),
                Err(McpError::UnknownTool(_)) | Err(McpError::NoClient(_)) => {
                    Json(error_response(
                        id,
                        INVALID_PARAMS,
                        "Invalid params",
                        Some(json!(format!("Tool '{name}' not found"))),
                    ))
                    .into_response()
                }
                Err(McpError::Rpc(e)) => {
                    Json(error_response(id, e.code, &e.message, e.data)).into_response()
                }
                Err(e) => Json(error_response(
                    id,
                    INTERNAL_ERROR,
                    "Internal error",
                    Some(json!(e.to_string())),
                ))
                .into_response(),
            }
        }
        other => Json(error_response(
            id,
            METHOD_NOT_FOUND,
            "Method not found",
            Some(json!(format!("Method '{other}' is not supported"))),
        ))
        .into_response(),
    }
}

async fn health(State(agg): State<Arc<Aggregator>>) -> Json<Value> {
    let tools = agg.tools().await;
    let connected = agg.connected_upstreams().await;
    Json(json!({
        "status": "ok",
        "tools_count": tools.len(),
        "connected_servers": connected.len(),
    }))
}

// ─── Admin API ───────────────────────────────────────────────────────────────

async fn list_servers(State(agg): State<Arc<Aggregator>>) -> Json<Value> {
    let servers: Vec<ServerConfig> = agg.servers().iter().map(ServerConfig::redacted).collect();
    let connected = agg.connected_upstreams().await;
    Json(json!({ "servers": servers, "connected": connected }))
}

async fn add_server(
    State(agg): State<Arc<Aggregator>>,
    Json(config): Json<ServerConfig>,
) -> Response {
    if let ServerConfig::Http { url, .. } = &config {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid URL format. Must start with http:// or https://"})),
            )
                .into_response();
        }
    }

    let identifier = config.identifier();
    match agg.add_server(config).await {
        Ok(true) => Json(json!({
            "success": true,
            "message": format!("Server {identifier} added successfully"),
        }))
        .into_response(),
        Ok(false) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Server already exists"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct DeleteRequest {
    identifier: String,
}

async fn delete_server(
    State(agg): State<Arc<Aggregator>>,
    Json(req): Json<DeleteRequest>,
) -> Response {
    match agg.remove_server(&req.identifier).await {
        Ok(true) => Json(json!({
            "success": true,
            "message": format!("Server {} removed successfully", req.identifier),
        }))
        .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Server not found"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct ImportRequest {
    config: String,
}

/// Import an `mcpServers` map as exported by common MCP clients.  Each entry
/// resolves to HTTP (by `url`) or stdio (by `command`); unknown shapes are
/// reported per entry without failing the batch.
async fn import_servers(
    State(agg): State<Arc<Aggregator>>,
    Json(req): Json<ImportRequest>,
) -> Response {
    let parsed: Value = match serde_json::from_str(req.config.trim()) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Invalid JSON format: {e}")})),
            )
                .into_response();
        }
    };
    let Some(entries) = parsed["mcpServers"].as_object() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No mcpServers found in config"})),
        )
            .into_response();
    };

    let mut added = Vec::new();
    let mut skipped = Vec::new();
    let mut errors = Vec::new();

    for (name, entry) in entries {
        let config = if let Some(url) = entry["url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("{name}: Invalid URL format"));
                continue;
            }
            ServerConfig::Http {
                url: url.to_string(),
                api_key: entry["api_key"].as_str().map(String::from),
            }
        } else if let Some(command) = entry["command"].as_str() {
            let args = entry["args"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            ServerConfig::Stdio {
                command: command.to_string(),
                args,
            }
        } else {
            errors.push(format!(
                "{name}: Unknown server type or missing required fields"
            ));
            continue;
        };

        let identifier = config.identifier();
        match agg.add_server(config).await {
            Ok(true) => added.push(json!({"name": name, "identifier": identifier})),
            Ok(false) => skipped.push(json!({"name": name, "reason": "Already exists"})),
            Err(e) => errors.push(format!("{name}: {e}")),
        }
    }

    Json(json!({
        "success": true,
        "message": format!("Imported {} server(s)", added.len()),
        "added": added,
        "skipped": skipped,
        "errors": errors,
    }))
    .into_response()
}

async fn reconnect(State(agg): State<Arc<Aggregator>>) -> Json<Value> {
    warn!("reconnecting to all mcp upstreams via admin api");
    agg.connect_to_remote_servers().await;
    let tools = agg.tools().await;
    let connected = agg.connected_upstreams().await;
    Json(json!({
        "success": true,
        "message": "Reconnected to all servers",
        "connected_servers": connected.len(),
        "total_tools": tools.len(),
    }))
}
