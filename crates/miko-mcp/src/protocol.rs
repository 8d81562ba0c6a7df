// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-RPC 2.0 envelope types and the MCP wire vocabulary shared by both
//! transports and the serving side.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// One tool as exposed by an upstream (or local) MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Transport-level error taxonomy for upstream calls.  Retrying is the
/// caller's responsibility; the transports never retry on their own.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("JSON-RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("upstream process exited")]
    ProcessExited,
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("no client for upstream {0}")]
    NoClient(String),
}

pub fn request_envelope(id: u64, method: &str, params: Option<Value>) -> Value {
    let mut env = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if let Some(p) = params {
        env["params"] = p;
    }
    env
}

pub fn notification_envelope(method: &str, params: Option<Value>) -> Value {
    let mut env = json!({
        "jsonrpc": "2.0",
        "method": method,
    });
    if let Some(p) = params {
        env["params"] = p;
    }
    env
}

pub fn success_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn error_response(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(d) = data {
        error["data"] = d;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// Interpret a decoded JSON-RPC response body: `error` wins over `result`; a
/// body with neither is returned whole (some servers omit the `result` key
/// on notifications-style replies).
pub fn extract_result(body: Value) -> Result<Value, McpError> {
    if let Some(err) = body.get("error") {
        let rpc: RpcError = serde_json::from_value(err.clone()).unwrap_or(RpcError {
            code: INTERNAL_ERROR,
            message: err.to_string(),
            data: None,
        });
        return Err(McpError::Rpc(rpc));
    }
    match body.get("result") {
        Some(r) => Ok(r.clone()),
        None => Ok(body),
    }
}

/// One configured MCP upstream.
///
/// Serializes as `{"type":"http","url":...}` or
/// `{"type":"stdio","command":...,"args":[...]}`; deserialization also
/// accepts the legacy bare-URL string form.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerConfig {
    Http {
        url: String,
        api_key: Option<String>,
    },
    Stdio {
        command: String,
        args: Vec<String>,
    },
}

impl ServerConfig {
    /// Stable identifier used as the routing-table key.
    pub fn identifier(&self) -> String {
        match self {
            ServerConfig::Http { url, .. } => url.clone(),
            ServerConfig::Stdio { command, args } => {
                format!("stdio:{command}:{}", args.join(":"))
            }
        }
    }

    /// Copy with credentials removed, safe for admin API listings.
    pub fn redacted(&self) -> ServerConfig {
        match self {
            ServerConfig::Http { url, .. } => ServerConfig::Http {
                url: url.clone(),
                api_key: None,
            },
            other => other.clone(),
        }
    }
}

impl Serialize for ServerConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match self {
            ServerConfig::Http { url, api_key } => {
                let mut v = json!({ "type": "http", "url": url });
                if let Some(k) = api_key {
                    v["api_key"] = json!(k);
                }
                v
            }
            ServerConfig::Stdio { command, args } => {
                json!({ "type": "stdio", "command": command, "args": args })
            }
        };
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Url(String),
            Entry {
                #[serde(rename = "type")]
                kind: Option<String>,
                url: Option<String>,
                api_key: Option<String>,
                command: Option<String>,
                #[serde(default)]
                args: Vec<String>,
            },
        }

        match Raw::deserialize(deserializer)? {
            Raw::Url(url) => Ok(ServerConfig::Http { url, api_key: None }),
            Raw::Entry {
                kind,
                url,
                api_key,
                command,
                args,
            } => match kind.as_deref() {
                Some("stdio") => {
                    let command = command
                        .filter(|c| !c.is_empty())
                        .ok_or_else(|| D::Error::custom("stdio server requires 'command'"))?;
                    Ok(ServerConfig::Stdio { command, args })
                }
                // "http" and missing type both resolve by the url field.
                _ => {
                    let url = url
                        .filter(|u| !u.is_empty())
                        .ok_or_else(|| D::Error::custom("http server requires 'url'"))?;
                    Ok(ServerConfig::Http { url, api_key })
                }
            },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_omits_params_when_none() {
        let env = request_envelope(7, "tools/list", None);
        assert_eq!(env["id"], 7);
        assert!(env.get("params").is_none());
    }

    #[test]
    fn notification_has_no_id() {
        let env = notification_envelope("notifications/initialized", Some(json!({})));
        assert!(env.get("id").is_none());
        assert_eq!(env["method"], "notifications/initialized");
    }

    #[test]
    fn extract_result_prefers_error() {
        let body = json!({"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}});
        match extract_result(body) {
            Err(McpError::Rpc(e)) => assert_eq!(e.code, METHOD_NOT_FOUND),
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[test]
    fn extract_result_returns_result_field() {
        let body = json!({"jsonrpc":"2.0","id":1,"result":{"tools":[]}});
        let r = extract_result(body).unwrap();
        assert!(r["tools"].as_array().unwrap().is_empty());
    }

    #[test]
    fn extract_result_without_result_returns_whole_body() {
        let body = json!({"jsonrpc":"2.0","id":1});
        let r = extract_result(body).unwrap();
        assert_eq!(r["jsonrpc"], "2.0");
    }

    #[test]
    fn server_config_legacy_bare_url() {
        let cfg: ServerConfig = serde_json::from_value(json!("https://host/mcp")).unwrap();
        assert_eq!(
            cfg,
            ServerConfig::Http {
                url: "https://host/mcp".into(),
                api_key: None
            }
        );
    }

    #[test]
    fn server_config_http_with_key_roundtrips() {
        let cfg: ServerConfig =
            serde_json::from_value(json!({"type":"http","url":"https://h/mcp","api_key":"k"}))
                .unwrap();
        let back = serde_json::to_value(&cfg).unwrap();
        assert_eq!(back["type"], "http");
        assert_eq!(back["api_key"], "k");
    }

    #[test]
    fn server_config_stdio_identifier() {
        let cfg: ServerConfig = serde_json::from_value(
            json!({"type":"stdio","command":"npx","args":["some-mcp-package"]}),
        )
        .unwrap();
        assert_eq!(cfg.identifier(), "stdio:npx:some-mcp-package");
    }

    #[test]
    fn server_config_stdio_missing_command_rejected() {
        let r: Result<ServerConfig, _> = serde_json::from_value(json!({"type":"stdio"}));
        assert!(r.is_err());
    }

    #[test]
    fn redacted_strips_api_key() {
        let cfg = ServerConfig::Http {
            url: "https://h/mcp".into(),
            api_key: Some("secret".into()),
        };
        let v = serde_json::to_value(cfg.redacted()).unwrap();
        assert!(v.get("api_key").is_none());
    }
}
