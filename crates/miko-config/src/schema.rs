// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be on unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ports: Ports,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// External vision model used for upstreams without native image input.
    #[serde(default)]
    pub vision: Option<VisionConfig>,
    #[serde(default)]
    pub characters: Vec<CharacterConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

/// TCP ports for the four cooperating processes.  Memory and monitor are
/// external collaborators; their ports are only used for outbound calls and
/// launcher readiness checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ports {
    #[serde(default = "Ports::default_main")]
    pub main: u16,
    #[serde(default = "Ports::default_agent")]
    pub agent: u16,
    #[serde(default = "Ports::default_memory")]
    pub memory: u16,
    #[serde(default = "Ports::default_monitor")]
    pub monitor: u16,
}

impl Ports {
    fn default_main() -> u16 {
        48911
    }
    fn default_agent() -> u16 {
        48912
    }
    fn default_memory() -> u16 {
        48913
    }
    fn default_monitor() -> u16 {
        48914
    }

    pub fn main_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.main)
    }
    pub fn agent_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.agent)
    }
    pub fn memory_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.memory)
    }
    pub fn monitor_ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.monitor)
    }
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            main: Self::default_main(),
            agent: Self::default_agent(),
            memory: Self::default_memory(),
            monitor: Self::default_monitor(),
        }
    }
}

/// Upstream realtime LLM connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket base URL of the realtime upstream.
    pub base_url: String,
    /// Model identifier appended as a query parameter.
    pub model: String,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    pub api_key: Option<String>,
    /// Environment variable holding the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Upstream profile key (see [`crate::lookup_profile`]).  Defaults to a
    /// substring match against the model name.
    pub profile: Option<String>,
    /// Default voice id when a character does not set one.
    pub voice: Option<String>,
    /// Minimum interval between native image frames.
    #[serde(default = "RealtimeConfig::default_image_min_interval_ms")]
    pub image_min_interval_ms: u64,
    /// Throttle window entered after an upstream 503/overload error.
    #[serde(default = "RealtimeConfig::default_throttle_ms")]
    pub throttle_ms: u64,
    /// Maximum in-flight frames on the upstream socket.
    #[serde(default = "RealtimeConfig::default_send_window")]
    pub send_window: usize,
    /// Seconds without detected speech before an aggressive-idle upstream
    /// session is closed.
    #[serde(default = "RealtimeConfig::default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
}

impl RealtimeConfig {
    fn default_image_min_interval_ms() -> u64 {
        1500
    }
    fn default_throttle_ms() -> u64 {
        2000
    }
    fn default_send_window() -> usize {
        25
    }
    fn default_silence_timeout_secs() -> u64 {
        90
    }

    /// Resolve the API key from the explicit field or the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            if !k.is_empty() {
                return Some(k.clone());
            }
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://dashscope.aliyuncs.com/api-ws/v1/realtime".into(),
            model: "qwen-omni-turbo-realtime".into(),
            api_key: None,
            api_key_env: Some("REALTIME_API_KEY".into()),
            profile: None,
            voice: None,
            image_min_interval_ms: Self::default_image_min_interval_ms(),
            throttle_ms: Self::default_throttle_ms(),
            send_window: Self::default_send_window(),
            silence_timeout_secs: Self::default_silence_timeout_secs(),
        }
    }
}

/// Auxiliary chat model used for classifiers and the dedup judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// OpenAI-compatible API base, ending before `/chat/completions`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    #[serde(default = "ClassifierConfig::default_max_tokens")]
    pub max_tokens: u32,
}

impl ClassifierConfig {
    fn default_max_tokens() -> u32 {
        600
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            if !k.is_empty() {
                return Some(k.clone());
            }
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".into(),
            model: "qwen/qwen3-30b-a3b-instruct".into(),
            api_key: None,
            api_key_env: Some("OPENROUTER_API_KEY".into()),
            max_tokens: Self::default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
}

/// One user-facing persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterConfig {
    pub name: String,
    pub prompt: String,
    pub voice_id: Option<String>,
    /// Per-character realtime model override.
    pub model: Option<String>,
}

/// GUI-automation worker invocation.  The instruction text is appended as the
/// final argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuiWorkerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub mcp_enabled: bool,
    #[serde(default)]
    pub computer_use_enabled: bool,
    #[serde(default)]
    pub user_plugin_enabled: bool,
    /// Base URL of the user-plugin service (`GET <url>/plugins`).
    pub plugin_server_url: Option<String>,
    pub gui_worker: Option<GuiWorkerConfig>,
    /// Upper bound on queued GUI tasks; a full queue rejects new dispatches.
    #[serde(default = "AgentConfig::default_gui_queue_limit")]
    pub gui_queue_limit: usize,
    /// Persisted MCP upstream list, atomically rewritten on admin mutation.
    #[serde(default = "AgentConfig::default_mcp_servers_file")]
    pub mcp_servers_file: PathBuf,
    /// Whether the conversation analyzer runs on every assistant turn.
    #[serde(default = "default_true")]
    pub analyzer_enabled: bool,
}

impl AgentConfig {
    fn default_gui_queue_limit() -> usize {
        32
    }
    fn default_mcp_servers_file() -> PathBuf {
        PathBuf::from("mcp_servers.json")
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mcp_enabled: false,
            computer_use_enabled: false,
            user_plugin_enabled: false,
            plugin_server_url: None,
            gui_worker: None,
            gui_queue_limit: Self::default_gui_queue_limit(),
            mcp_servers_file: Self::default_mcp_servers_file(),
            analyzer_enabled: true,
        }
    }
}

/// External collaborator process started by the launcher alongside the main
/// and agent processes (memory, monitor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalService {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Port polled for readiness; `None` means ready as soon as spawned.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub external: Vec<ExternalService>,
    #[serde(default = "LauncherConfig::default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

impl LauncherConfig {
    fn default_ready_timeout_secs() -> u64 {
        60
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            external: Vec::new(),
            ready_timeout_secs: Self::default_ready_timeout_secs(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_match_documented_values() {
        let p = Ports::default();
        assert_eq!(p.main, 48911);
        assert_eq!(p.agent, 48912);
        assert_eq!(p.memory, 48913);
        assert_eq!(p.monitor, 48914);
    }

    #[test]
    fn port_urls_are_loopback() {
        let p = Ports::default();
        assert_eq!(p.agent_url(), "http://127.0.0.1:48912");
        assert_eq!(p.monitor_ws_url(), "ws://127.0.0.1:48914");
    }

    #[test]
    fn realtime_defaults() {
        let r = RealtimeConfig::default();
        assert_eq!(r.throttle_ms, 2000);
        assert_eq!(r.send_window, 25);
        assert_eq!(r.silence_timeout_secs, 90);
    }

    #[test]
    fn resolve_api_key_prefers_explicit() {
        let r = RealtimeConfig {
            api_key: Some("sk-explicit".into()),
            api_key_env: Some("MIKO_TEST_KEY_UNSET".into()),
            ..Default::default()
        };
        assert_eq!(r.resolve_api_key().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn resolve_api_key_empty_explicit_falls_through() {
        let r = RealtimeConfig {
            api_key: Some(String::new()),
            api_key_env: Some("MIKO_TEST_KEY_DEFINITELY_UNSET".into()),
            ..Default::default()
        };
        assert_eq!(r.resolve_api_key(), None);
    }

    #[test]
    fn agent_defaults_disable_all_backends() {
        let a = AgentConfig::default();
        assert!(!a.mcp_enabled);
        assert!(!a.computer_use_enabled);
        assert!(!a.user_plugin_enabled);
        assert!(a.analyzer_enabled);
        assert_eq!(a.gui_queue_limit, 32);
    }

    #[test]
    fn config_parses_from_minimal_yaml() {
        let cfg: Config = serde_yaml::from_str(
            "characters:\n  - name: momo\n    prompt: You are Momo.\n",
        )
        .unwrap();
        assert_eq!(cfg.characters.len(), 1);
        assert_eq!(cfg.characters[0].name, "momo");
        assert!(cfg.characters[0].voice_id.is_none());
    }
}
