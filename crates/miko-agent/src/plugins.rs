// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! User-plugin registry client.
//!
//! Plugins are user-defined HTTP endpoints registered with an external
//! plugin service.  The listing is refreshed on demand from
//! `GET <base>/plugins`; a fetch failure keeps the last good cache so a
//! briefly unreachable plugin service does not drop the whole backend.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap on the rendered plugin listing passed to the classifier prompt.
const MAX_LISTING_CHARS: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub endpoint: Option<String>,
}

pub struct PluginRegistry {
    base_url: Option<String>,
    http: reqwest::Client,
    cached: Mutex<Vec<PluginEntry>>,
}

impl PluginRegistry {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
            cached: Mutex::new(Vec::new()),
        }
    }

    /// Current listing, refreshed from the plugin service when `force` is
    /// set or the cache is empty.  Only a non-empty fetch replaces the
    /// cache.
    pub async fn list(&self, force: bool) -> Vec<PluginEntry> {
        {
            let cached = self.cached.lock().await;
            if !force && !cached.is_empty() {
                return cached.clone();
            }
        }

        let Some(base) = self.base_url.as_deref() else {
            return self.cached.lock().await.clone();
        };

        let url = format!("{}/plugins", base.trim_end_matches('/'));
        match self.http.get(&url).timeout(FETCH_TIMEOUT).send().await {
            Ok(resp) => match resp.json::<Value>().await {
                Ok(body) => {
                    let raw = if body.is_array() {
                        body
                    } else {
                        body["plugins"].clone()
                    };
                    let fetched: Vec<PluginEntry> =
                        serde_json::from_value(raw).unwrap_or_default();
                    if !fetched.is_empty() {
                        *self.cached.lock().await = fetched;
                    }
                }
                Err(e) => warn!("plugin listing body unreadable: {e}"),
            },
            Err(e) => warn!("plugin listing fetch failed: {e}"),
        }

        let cached = self.cached.lock().await.clone();
        debug!(count = cached.len(), "plugin registry state");
        cached
    }

    pub async fn find(&self, id: &str) -> Option<PluginEntry> {
        let cached = self.cached.lock().await;
        cached.iter().find(|p| p.id == id).cloned()
    }
}

/// Render the plugin listing for the classifier prompt: id, description,
/// and schema per line, truncated to a sane prompt size.
pub fn describe_plugins(plugins: &[PluginEntry]) -> String {
    if plugins.is_empty() {
        return "No plugins available.".to_string();
    }
    let mut listing = plugins
        .iter()
        .map(|p| {
            let schema = serde_json::to_string(&p.input_schema).unwrap_or_else(|_| "{}".into());
            format!("- {}: {} | schema: {}", p.id, p.description, schema)
        })
        .collect::<Vec<_>>()
        .join("\n");
    if listing.len() > MAX_LISTING_CHARS {
        let cut = listing
            .char_indices()
            .take_while(|(i, _)| *i < MAX_LISTING_CHARS)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        listing.truncate(cut);
        listing.push_str("\n... (truncated)");
    }
    listing
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
