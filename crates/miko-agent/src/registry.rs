// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory task registry.
//!
//! One entry per dispatched tool invocation.  Status transitions are
//! monotonic — `queued → running → completed | failed` — and terminal
//! states are frozen: a consumer that has observed `completed` will never
//! later observe `running`.  Entries live for the process lifetime only.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Mcp,
    GuiAuto,
    Plugin,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskEntry {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    pub params: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub lanlan_name: Option<String>,
}

impl TaskEntry {
    pub fn queued(
        id: impl Into<String>,
        kind: TaskKind,
        params: Value,
        lanlan_name: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            status: TaskStatus::Queued,
            start_time: Utc::now(),
            params,
            result: None,
            error: None,
            lanlan_name,
        }
    }

    /// Human-readable description used by the dedup judge.
    pub fn description(&self) -> String {
        self.params["query"]
            .as_str()
            .or_else(|| self.params["instruction"].as_str())
            .unwrap_or("")
            .to_string()
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    inner: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: TaskEntry) {
        self.inner.lock().unwrap().insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<TaskEntry> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<TaskEntry> {
        let mut entries: Vec<TaskEntry> = self.inner.lock().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        entries
    }

    /// `(id, description)` pairs for queued/running tasks, optionally
    /// filtered by character.  Feeds the dedup judge.
    pub fn active_descriptions(&self, lanlan_name: Option<&str>) -> Vec<(String, String)> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|e| !e.status.is_terminal())
            .filter(|e| match (lanlan_name, &e.lanlan_name) {
                (Some(wanted), Some(owner)) => wanted == owner,
                _ => true,
            })
            .filter(|e| !e.description().is_empty())
            .map(|e| (e.id.clone(), e.description()))
            .collect()
    }

    fn transition(&self, id: &str, next: TaskStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.get_mut(id) else {
            return false;
        };
        if entry.status.is_terminal() {
            warn!(
                id,
                from = ?entry.status,
                to = ?next,
                "rejecting status transition out of a terminal state"
            );
            return false;
        }
        entry.status = next;
        true
    }

    pub fn set_running(&self, id: &str) -> bool {
        self.transition(id, TaskStatus::Running)
    }

    pub fn complete(&self, id: &str, result: Value) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.get_mut(id) else {
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }
        entry.status = TaskStatus::Completed;
        entry.result = Some(result);
        true
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.get_mut(id) else {
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }
        entry.status = TaskStatus::Failed;
        entry.error = Some(error.into());
        true
    }

    /// Administrative reset: every non-terminal entry fails with the given
    /// reason.
    pub fn fail_all_active(&self, reason: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for entry in inner.values_mut() {
            if !entry.status.is_terminal() {
                entry.status = TaskStatus::Failed;
                entry.error = Some(reason.to_string());
                count += 1;
            }
        }
        count
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
