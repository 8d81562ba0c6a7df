// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Backend classifier decisions.
//!
//! Each backend has its own decision shape, returned as strict JSON by a
//! temperature-0 classifier call.  Models do not always comply: code-fence
//! wrappers are stripped, and anything that still fails to parse is treated
//! as "no task" for that backend rather than an error for the caller.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpDecision {
    #[serde(default)]
    pub has_task: bool,
    #[serde(default)]
    pub can_execute: bool,
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_args: Option<Value>,
    #[serde(default)]
    pub reason: String,
}

impl McpDecision {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn accepted(&self) -> bool {
        self.has_task && self.can_execute
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuiDecision {
    #[serde(default)]
    pub has_task: bool,
    #[serde(default)]
    pub can_execute: bool,
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub reason: String,
}

impl GuiDecision {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn accepted(&self) -> bool {
        self.has_task && self.can_execute
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginDecision {
    #[serde(default)]
    pub has_task: bool,
    #[serde(default)]
    pub can_execute: bool,
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub plugin_id: Option<String>,
    #[serde(default)]
    pub plugin_args: Option<Value>,
    #[serde(default)]
    pub reason: String,
}

impl PluginDecision {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn accepted(&self) -> bool {
        self.has_task && self.can_execute
    }
}

/// Remove a markdown code-fence wrapper, if present.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .replace("```json", "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// Parse one classifier reply.  `None` means "no task" — the caller logs
/// and moves on; a malformed reply never fails the dispatch.
pub fn parse_decision<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let cleaned = strip_code_fences(raw);
    if cleaned.is_empty() {
        warn!("empty classifier reply");
        return None;
    }
    match serde_json::from_str(&cleaned) {
        Ok(decision) => Some(decision),
        Err(e) => {
            warn!(
                "unparseable classifier reply ({e}): {}",
                &cleaned.chars().take(200).collect::<String>()
            );
            None
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
