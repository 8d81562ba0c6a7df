// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Built-in local tools.  These seed the merged catalog so the aggregator is
//! useful without any upstream configured, and they claim their names first
//! in the collision order.

use chrono::Local;
use serde_json::{json, Value};

use crate::protocol::ToolDescriptor;

pub fn local_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "echo".into(),
            description: "Echo the input text back".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Text to echo" }
                },
                "required": ["message"]
            }),
        },
        ToolDescriptor {
            name: "add".into(),
            description: "Add two numbers".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "a": { "type": "number" },
                    "b": { "type": "number" }
                },
                "required": ["a", "b"]
            }),
        },
        ToolDescriptor {
            name: "get_time".into(),
            description: "Get the current local time".into(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
    ]
}

fn text_content(text: String) -> Value {
    json!({ "content": [ { "type": "text", "text": text } ] })
}

/// Execute a local tool inline.  Returns `None` for names not owned locally,
/// `Some(Err(reason))` for bad arguments.
pub fn call_local(name: &str, arguments: &Value) -> Option<Result<Value, String>> {
    match name {
        "echo" => {
            let message = arguments["message"].as_str().unwrap_or("");
            Some(Ok(text_content(format!("Echo: {message}"))))
        }
        "add" => {
            let (Some(a), Some(b)) = (arguments["a"].as_f64(), arguments["b"].as_f64()) else {
                return Some(Err("add requires numeric 'a' and 'b'".into()));
            };
            Some(Ok(text_content(format!("{a} + {b} = {}", a + b))))
        }
        "get_time" => Some(Ok(text_content(format!(
            "Current time: {}",
            Local::now().to_rfc3339()
        )))),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
