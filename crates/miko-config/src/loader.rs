// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Layered configuration loading.
//!
//! Configuration is assembled by stacking YAML layers: a system-wide file,
//! the user's config directory, a workspace-local `.miko/` dotfile, and a
//! bare `miko.yaml` in the working tree, in that order of increasing
//! priority.  An explicit `--config` path goes on top of the stack and,
//! unlike the discovered layers, must exist.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_yaml::Value;
use tracing::debug;

use crate::Config;

/// Candidate layer locations, lowest priority first.
fn layer_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/etc/miko/config.yaml"),
        PathBuf::from("/etc/miko/config.yml"),
    ];

    let user_dirs = [
        dirs::home_dir().map(|home| home.join(".config/miko")),
        dirs::config_dir().map(|dir| dir.join("miko")),
    ];
    for dir in user_dirs.into_iter().flatten() {
        candidates.push(dir.join("config.yaml"));
        candidates.push(dir.join("config.yml"));
    }

    // Workspace-local overrides: a .miko/ dotfile directory for checked-in
    // project settings, then a bare file for quick experiments.
    for name in [
        ".miko/config.yaml",
        ".miko/config.yml",
        "miko.yaml",
        "miko.yml",
    ] {
        candidates.push(PathBuf::from(name));
    }

    candidates
}

fn read_layer(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config layer {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("parsing config layer {}", path.display()))
}

/// Stack one layer on top of the accumulated configuration.
///
/// Mappings combine key by key so a layer can override a single port
/// without restating the whole `ports` table.  Everything else — scalars
/// and sequences alike — is taken wholesale from the upper layer: a layer
/// that sets `characters` defines the entire roster, it does not append
/// to the one below.
fn overlay(accumulated: &mut Value, layer: Value) {
    match (accumulated, layer) {
        (Value::Mapping(lower), Value::Mapping(upper)) => {
            for (key, value) in upper {
                match lower.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        lower.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Assemble the configuration from every discovered layer plus the
/// optional explicit path.  With nothing found anywhere, the built-in
/// defaults apply; a layer that exists but does not match the schema is a
/// hard error rather than a silent fallback.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut stacked = Value::Mapping(serde_yaml::Mapping::new());
    let mut layers_applied = 0usize;

    for candidate in layer_candidates() {
        if !candidate.is_file() {
            continue;
        }
        debug!(layer = %candidate.display(), "applying config layer");
        overlay(&mut stacked, read_layer(&candidate)?);
        layers_applied += 1;
    }

    if let Some(path) = explicit {
        debug!(layer = %path.display(), "applying explicit config");
        overlay(&mut stacked, read_layer(path)?);
        layers_applied += 1;
    }

    if layers_applied == 0 {
        return Ok(Config::default());
    }
    serde_yaml::from_value(stacked).context("interpreting merged configuration")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
