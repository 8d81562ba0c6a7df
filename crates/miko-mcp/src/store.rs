// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persisted upstream list (`mcp_servers.json`).
//!
//! The file is rewritten atomically (write to a sibling temp file, then
//! rename) so a crash mid-save never leaves a truncated config behind.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};

use crate::protocol::ServerConfig;

pub struct ServerStore {
    path: PathBuf,
    servers: Mutex<Vec<ServerConfig>>,
}

impl ServerStore {
    /// Load the store from disk; a missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let servers = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(v) => serde_json::from_value::<Vec<ServerConfig>>(v["servers"].clone())
                    .unwrap_or_default(),
                Err(e) => {
                    warn!(path = %path.display(), "unreadable server config: {e}");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        info!(path = %path.display(), count = servers.len(), "loaded mcp server list");
        Self {
            path,
            servers: Mutex::new(servers),
        }
    }

    pub fn servers(&self) -> Vec<ServerConfig> {
        self.servers.lock().unwrap().clone()
    }

    /// Add a server.  Returns `false` when the identifier already exists.
    pub fn add(&self, config: ServerConfig) -> anyhow::Result<bool> {
        {
            let mut guard = self.servers.lock().unwrap();
            if guard.iter().any(|s| s.identifier() == config.identifier()) {
                return Ok(false);
            }
            guard.push(config);
        }
        self.save()?;
        Ok(true)
    }

    /// Remove a server by identifier.  Returns `false` when not found.
    pub fn remove(&self, identifier: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut guard = self.servers.lock().unwrap();
            let before = guard.len();
            guard.retain(|s| s.identifier() != identifier);
            guard.len() != before
        };
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> anyhow::Result<()> {
        let servers = self.servers.lock().unwrap().clone();
        let body = serde_json::to_string_pretty(&json!({
            "servers": servers,
            "updated_at": chrono::Local::now().to_rfc3339(),
        }))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        info!(path = %self.path.display(), count = servers.len(), "saved mcp server list");
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
