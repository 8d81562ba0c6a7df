// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! MCP aggregation core.
//!
//! Speaks MCP (JSON-RPC 2.0) to multiple upstream servers over two
//! transports — HTTP with optional SSE response bodies, and newline-delimited
//! JSON over a child process's stdio — and presents one merged tool catalog.
//! Tool-name collisions resolve first-seen-wins; `tools/call` routes back to
//! the upstream that owns the name.  The aggregator itself is served as an
//! MCP endpoint (`POST /mcp`) with a localhost-only admin API for mutating
//! the persisted upstream list.

mod aggregator;
mod http;
mod local;
mod protocol;
mod server;
mod stdio;
mod store;

pub use aggregator::{Aggregator, UpstreamClient};
pub use http::HttpClient;
pub use protocol::{
    error_response, success_response, McpError, RpcError, ServerConfig, ToolDescriptor,
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION,
};
pub use server::router;
pub use stdio::StdioClient;
pub use store::ServerStore;
