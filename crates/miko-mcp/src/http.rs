// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP transport for MCP upstreams.
//!
//! One POST per JSON-RPC request.  Servers may answer with a plain JSON body
//! or with an SSE stream; the two are distinguished by content-type, never
//! by URL.  Streamable-HTTP servers hand out a session id in the
//! `mcp-session-id` response header on `initialize`, which must then be
//! echoed on every later request.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    extract_result, notification_envelope, request_envelope, McpError, ToolDescriptor,
    INVALID_PARAMS, PROTOCOL_VERSION,
};

const SESSION_HEADER: &str = "mcp-session-id";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpClient {
    base_url: String,
    endpoint: String,
    api_key: Option<String>,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    initialized: AtomicBool,
}

impl HttpClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        // Remote MCP URLs often already carry the full path.
        let endpoint = if base.ends_with("/mcp") {
            base.clone()
        } else {
            format!("{base}/mcp")
        };
        Self {
            base_url: base,
            endpoint,
            api_key,
            http: reqwest::Client::new(),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> String {
        self.base_url.clone()
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, McpError> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .timeout(DEFAULT_TIMEOUT)
            .header("Accept", "application/json, text/event-stream")
            .json(payload);
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }
        if let Some(sid) = self.session_id.lock().await.as_deref() {
            req = req.header(SESSION_HEADER, sid);
        }
        req.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout
            } else {
                McpError::Transport(e.to_string())
            }
        })
    }

    /// Capture a session id handed out in the response headers.
    async fn adopt_session_id(&self, resp: &reqwest::Response) {
        if let Some(sid) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.lock().await;
            if guard.is_none() {
                debug!(url = %self.base_url, "adopted mcp session id");
                *guard = Some(sid.to_string());
            }
        }
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let payload = request_envelope(self.next_request_id(), method, params);
        debug!(url = %self.base_url, method, "sending mcp request");

        let resp = self.post(&payload).await?;
        self.adopt_session_id(&resp).await;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = resp
            .text()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(McpError::Http {
                status: status.as_u16(),
                body: text.chars().take(200).collect(),
            });
        }

        let body = if content_type.contains("text/event-stream") {
            parse_sse_body(&text)
                .ok_or_else(|| McpError::Transport("no JSON payload in SSE body".into()))?
        } else {
            serde_json::from_str(&text).map_err(|e| McpError::Transport(e.to_string()))?
        };
        extract_result(body)
    }

    /// Fire-and-forget notification; failures are non-critical.
    async fn notify(&self, method: &str, params: Option<Value>) {
        let payload = notification_envelope(method, params);
        match self.post(&payload).await {
            Ok(resp) => debug!(method, status = %resp.status(), "notification sent"),
            Err(e) => debug!(method, "notification failed (non-critical): {e}"),
        }
    }

    pub async fn initialize(&self) -> Result<(), McpError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "miko-mcp-client", "version": "0.3.0" }
                })),
            )
            .await?;
        self.initialized.store(true, Ordering::SeqCst);
        let server_name = result["serverInfo"]["name"].as_str().unwrap_or("unknown");
        info!(url = %self.base_url, server = server_name, "mcp upstream initialized");

        // Some servers require this before serving tools/list.
        self.notify("notifications/initialized", Some(json!({}))).await;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        self.initialize().await?;

        // Standard form first: no params field at all.  A -32602 reply means
        // the server insists on an explicit empty object.
        let result = match self.request("tools/list", None).await {
            Err(McpError::Rpc(e)) if e.code == INVALID_PARAMS => {
                debug!(url = %self.base_url, "tools/list rejected bare params, retrying with {{}}");
                self.request("tools/list", Some(json!({}))).await
            }
            other => other,
        };

        match result {
            Ok(body) => {
                let tools: Vec<ToolDescriptor> =
                    serde_json::from_value(body["tools"].clone()).unwrap_or_default();
                info!(url = %self.base_url, count = tools.len(), "received tool catalog");
                Ok(tools)
            }
            Err(e) => {
                warn!(url = %self.base_url, "tools/list failed: {e}");
                Err(e)
            }
        }
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.initialize().await?;
        let result = self
            .request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await;
        match &result {
            Ok(_) => info!(url = %self.base_url, tool = name, "tool call succeeded"),
            Err(e) => error!(url = %self.base_url, tool = name, "tool call failed: {e}"),
        }
        result
    }
}

/// Parse an SSE body into the first non-empty `data:` JSON payload.
///
/// Wire format: `event: message\ndata: {...}\n\n`, possibly repeated.
/// Unparseable `data:` lines are skipped rather than treated as fatal — a
/// server may interleave keep-alive comments with the real payload.
pub(crate) fn parse_sse_body(text: &str) -> Option<Value> {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("data:") {
            let json_str = rest.trim();
            if json_str.is_empty() {
                continue;
            }
            if let Ok(v) = serde_json::from_str::<Value>(json_str) {
                return Some(v);
            }
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
