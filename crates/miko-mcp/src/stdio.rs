// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! stdio transport for MCP upstreams.
//!
//! The configured command is spawned as a child process; JSON-RPC frames are
//! newline-delimited JSON on stdin/stdout.  Responses arrive out of band, so
//! a pending-request table keyed by id pairs them back up.  When the child's
//! stdout closes, every pending request fails with a descriptive error.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::protocol::{
    extract_result, request_envelope, McpError, RpcError, ToolDescriptor, INTERNAL_ERROR,
    PROTOCOL_VERSION,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, McpError>>>>>;

struct ProcHandle {
    child: Child,
    stdin: ChildStdin,
    read_task: tokio::task::JoinHandle<()>,
}

pub struct StdioClient {
    command: String,
    args: Vec<String>,
    next_id: AtomicU64,
    initialized: AtomicBool,
    proc: Mutex<Option<ProcHandle>>,
    pending: PendingMap,
}

impl StdioClient {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            next_id: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            proc: Mutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn identifier(&self) -> String {
        format!("stdio:{}:{}", self.command, self.args.join(":"))
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fail every outstanding request.  Called when the child's stdout
    /// closes or the client shuts down.
    fn fail_pending(pending: &PendingMap) {
        let mut map = pending.lock().unwrap();
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(McpError::ProcessExited));
        }
    }

    async fn ensure_started(&self) -> Result<(), McpError> {
        let mut guard = self.proc.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        info!(command = %self.command, "starting stdio mcp server");
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| McpError::Transport(format!("spawn {}: {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;

        let pending = Arc::clone(&self.pending);
        let identifier = self.identifier();
        let read_task = tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        error!(upstream = %identifier, "stdio read error: {e}");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        error!(upstream = %identifier, "bad JSON from stdio server: {e}");
                        continue;
                    }
                };
                let Some(id) = response.get("id").and_then(Value::as_u64) else {
                    debug!(upstream = %identifier, "ignoring frame without numeric id");
                    continue;
                };
                let tx = pending.lock().unwrap().remove(&id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(match response.get("error") {
                            Some(err) => {
                                let rpc: RpcError = serde_json::from_value(err.clone())
                                    .unwrap_or(RpcError {
                                        code: INTERNAL_ERROR,
                                        message: err.to_string(),
                                        data: None,
                                    });
                                Err(McpError::Rpc(rpc))
                            }
                            None => extract_result(response),
                        });
                    }
                    None => {
                        warn!(upstream = %identifier, id, "response for unknown request id");
                    }
                }
            }
            debug!(upstream = %identifier, "stdio read loop ended");
            Self::fail_pending(&pending);
        });

        *guard = Some(ProcHandle {
            child,
            stdin,
            read_task,
        });
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.ensure_started().await?;

        let id = self.next_request_id();
        let payload = request_envelope(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        {
            let mut guard = self.proc.lock().await;
            let handle = guard.as_mut().ok_or(McpError::ProcessExited)?;
            let mut line = payload.to_string();
            line.push('\n');
            if let Err(e) = handle.stdin.write_all(line.as_bytes()).await {
                self.pending.lock().unwrap().remove(&id);
                return Err(McpError::Transport(format!("stdin write: {e}")));
            }
        }

        match tokio::time::timeout(DEFAULT_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ProcessExited),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                error!(command = %self.command, method, "stdio request timed out");
                Err(McpError::Timeout)
            }
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
        info!(command = %self.command, server = server_name, "stdio upstream initialized");
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        self.initialize().await?;
        let body = self.request("tools/list", None).await?;
        let tools: Vec<ToolDescriptor> =
            serde_json::from_value(body["tools"].clone()).unwrap_or_default();
        info!(command = %self.command, count = tools.len(), "received tool catalog");
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.initialize().await?;
        self.request(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// Terminate the child: SIGTERM, 3 s grace, then SIGKILL.
    pub async fn close(&self) {
        let Some(mut handle) = self.proc.lock().await.take() else {
            return;
        };
        handle.read_task.abort();

        #[cfg(unix)]
        if let Some(pid) = handle.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, handle.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(command = %self.command, "stdio server ignored SIGTERM, killing");
                let _ = handle.child.start_kill();
                let _ = handle.child.wait().await;
            }
        }

        Self::fail_pending(&self.pending);
        self.initialized.store(false, Ordering::SeqCst);
        debug!(command = %self.command, "stdio upstream closed");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
