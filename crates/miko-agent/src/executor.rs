// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The dispatcher: given a conversation window, decide whether a task is
//! present and hand it to exactly one backend.
//!
//! Every enabled backend is assessed concurrently by its own classifier
//! call; when several would accept, priority is MCP > GUI-automation >
//! user plugin.  A classifier failure only disables that backend for this
//! dispatch — it never errors the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use miko_config::AgentConfig;
use miko_mcp::{Aggregator, ToolDescriptor};
use miko_model::{ChatModel, ChatRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::decision::{parse_decision, GuiDecision, McpDecision, PluginDecision};
use crate::plugins::{describe_plugins, PluginRegistry};

/// Three attempts with delays [1s, 2s]: the final attempt follows straight
/// after the second delay, so callers see a rapid last retry.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];
const MAX_ATTEMPTS: usize = 3;

/// Conversation turns considered by the classifiers.
const CONVERSATION_WINDOW: usize = 10;

/// Notification summaries sent back to the main process are capped here.
const NOTIFY_MAX_CHARS: usize = 240;

const NOTIFY_TIMEOUT: Duration = Duration::from_millis(500);
const PLUGIN_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const CAPABILITIES_TTL: Duration = Duration::from_secs(10);

/// One turn as posted by the main process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    #[serde(default)]
    pub text: String,
}

/// Backend feature flags, mutable at runtime via the agent API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentFlags {
    pub mcp_enabled: bool,
    pub computer_use_enabled: bool,
    pub user_plugin_enabled: bool,
}

impl AgentFlags {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            mcp_enabled: config.mcp_enabled,
            computer_use_enabled: config.computer_use_enabled,
            user_plugin_enabled: config.user_plugin_enabled,
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.mcp_enabled || self.computer_use_enabled || self.user_plugin_enabled
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub has_task: bool,
    pub task_description: String,
    /// "mcp" | "gui_auto" | "user_plugin" | "none"
    pub execution_method: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<Value>,
    pub reason: String,
}

impl TaskResult {
    fn new(task_id: &str, method: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            has_task: true,
            task_description: String::new(),
            execution_method: method.to_string(),
            success: false,
            result: None,
            error: None,
            tool_name: None,
            tool_args: None,
            reason: String::new(),
        }
    }
}

pub struct TaskExecutor {
    model: Arc<dyn ChatModel>,
    mcp: Arc<Aggregator>,
    pub plugins: PluginRegistry,
    http: reqwest::Client,
    main_base: String,
    classifier_max_tokens: u32,
    caps_cache: Mutex<Option<(Instant, Vec<ToolDescriptor>)>>,
}

/// Truncate to a character budget without splitting a code point.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

impl TaskExecutor {
    pub fn new(
        model: Arc<dyn ChatModel>,
        mcp: Arc<Aggregator>,
        plugins: PluginRegistry,
        main_base: String,
        classifier_max_tokens: u32,
    ) -> Self {
        Self {
            model,
            mcp,
            plugins,
            http: reqwest::Client::new(),
            main_base,
            classifier_max_tokens,
            caps_cache: Mutex::new(None),
        }
    }

    // ─── Capability / formatting helpers ─────────────────────────────────────

    /// Merged MCP catalog with a short TTL so concurrent dispatches do not
    /// hammer the upstreams with redundant `tools/list` roundtrips.
    pub async fn capabilities(&self, force_refresh: bool) -> Vec<ToolDescriptor> {
        {
            let cache = self.caps_cache.lock().await;
            if !force_refresh {
                if let Some((at, tools)) = cache.as_ref() {
                    if at.elapsed() < CAPABILITIES_TTL {
                        return tools.clone();
                    }
                }
            }
        }
        let tools = self.mcp.tools().await;
        *self.caps_cache.lock().await = Some((Instant::now(), tools.clone()));
        tools
    }

    fn format_messages(messages: &[ChatTurn]) -> String {
        messages
            .iter()
            .rev()
            .take(CONVERSATION_WINDOW)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .filter(|m| !m.text.is_empty())
            .map(|m| format!("{}: {}", m.role, m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn format_tools(tools: &[ToolDescriptor]) -> String {
        if tools.is_empty() {
            return "No MCP tools available.".to_string();
        }
        let mut lines = Vec::new();
        for tool in tools {
            lines.push(format!("- {}: {}", tool.name, tool.description));
            let properties = tool.input_schema["properties"].as_object();
            let required: Vec<&str> = tool.input_schema["required"]
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if let Some(properties) = properties {
                for (name, info) in properties {
                    let kind = info["type"].as_str().unwrap_or("any");
                    let requirement = if required.contains(&name.as_str()) {
                        "(required)"
                    } else {
                        "(optional)"
                    };
                    lines.push(format!("    - {name}: {kind} {requirement}"));
                }
            }
        }
        lines.join("\n")
    }

    // ─── Classifier calls ────────────────────────────────────────────────────

    /// One classifier call with the retry schedule.  `None` means the
    /// backend stays silent for this dispatch.
    async fn classify(&self, label: &str, system: String, user: String, max_tokens: u32) -> Option<String> {
        for attempt in 0..MAX_ATTEMPTS {
            match self
                .model
                .complete(ChatRequest::classifier(system.clone(), user.clone(), max_tokens))
                .await
            {
                Ok(reply) => return Some(reply),
                Err(e) => {
                    if attempt + 1 < MAX_ATTEMPTS {
                        let delay = RETRY_DELAYS[attempt.min(RETRY_DELAYS.len() - 1)];
                        warn!(
                            label,
                            attempt = attempt + 1,
                            "classifier call failed, retrying in {}s: {e}",
                            delay.as_secs()
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        error!(label, "classifier failed after {MAX_ATTEMPTS} attempts: {e}");
                    }
                }
            }
        }
        None
    }

    async fn assess_mcp(&self, conversation: &str, tools: &[ToolDescriptor]) -> McpDecision {
        if tools.is_empty() {
            return McpDecision::rejected("No MCP tools available");
        }
        let system = format!(
            "You are an MCP tool selection agent. Your ONLY job is to determine if the user's \
             request can be handled by the available MCP tools.\n\n\
             AVAILABLE MCP TOOLS:\n{}\n\n\
             INSTRUCTIONS:\n\
             1. Analyze if the conversation contains an actionable task request\n\
             2. If yes, determine if ANY of the available MCP tools can handle it\n\
             3. If a tool can handle it, provide the exact tool name and arguments\n\
             4. Be precise with the tool arguments - they must match the tool's schema\n\n\
             OUTPUT FORMAT (strict JSON):\n\
             {{\"has_task\": boolean, \"can_execute\": boolean, \"task_description\": \"...\", \
             \"tool_name\": \"exact_tool_name or null\", \"tool_args\": {{...}} or null, \
             \"reason\": \"why this decision\"}}",
            Self::format_tools(tools)
        );
        let user = format!("Conversation:\n{conversation}");
        match self
            .classify("mcp", system, user, self.classifier_max_tokens)
            .await
        {
            Some(reply) => parse_decision(&reply)
                .unwrap_or_else(|| McpDecision::rejected("Unparseable assessment")),
            None => McpDecision::rejected("Assessment failed after retries"),
        }
    }

    async fn assess_gui(&self, conversation: &str) -> GuiDecision {
        let system = "You are a GUI automation assessment agent. Your ONLY job is to determine \
             if the user's request requires GUI/desktop automation.\n\n\
             GUI AUTOMATION CAPABILITIES:\n\
             - Control mouse (click, move, drag)\n\
             - Control keyboard (type, hotkeys)\n\
             - Open/close applications\n\
             - Browse the web\n\
             - Interact with desktop UI elements\n\n\
             INSTRUCTIONS:\n\
             1. Analyze if the conversation contains an actionable task request\n\
             2. Determine if the task REQUIRES GUI interaction (opening apps, clicking, browsing)\n\
             3. Tasks that can be done via API/tools (file operations, data queries) do NOT need GUI\n\n\
             OUTPUT FORMAT (strict JSON):\n\
             {\"has_task\": boolean, \"can_execute\": boolean, \"task_description\": \"...\", \
             \"reason\": \"why this decision\"}"
            .to_string();
        let user = format!("Conversation:\n{conversation}");
        match self.classify("gui", system, user, 400).await {
            Some(reply) => parse_decision(&reply)
                .unwrap_or_else(|| GuiDecision::rejected("Unparseable assessment")),
            None => GuiDecision::rejected("Assessment failed after retries"),
        }
    }

    async fn assess_plugin(
        &self,
        conversation: &str,
        plugins: &[crate::plugins::PluginEntry],
    ) -> PluginDecision {
        if plugins.is_empty() {
            return PluginDecision::rejected("No plugins");
        }
        let example = json!({
            "has_task": true,
            "can_execute": true,
            "task_description": "example: call testPlugin with a message",
            "plugin_id": "testPlugin",
            "plugin_args": {"message": "hello"}
        });
        let system = format!(
            "You are a User Plugin selection agent. AVAILABLE PLUGINS:\n{}\n\n\
             INSTRUCTIONS:\n\
             1. Analyze the conversation and determine if any available plugin can handle the \
             user's request.\n\
             2. If yes, return the plugin id and arguments matching the plugin's schema.\n\
             3. OUTPUT MUST BE ONLY a single JSON object and NOTHING ELSE. No markdown, no fences.\n\n\
             EXAMPLE (must follow this structure exactly):\n{example}\n\n\
             OUTPUT FORMAT:\n\
             {{\"has_task\": boolean, \"can_execute\": boolean, \"task_description\": \"...\", \
             \"plugin_id\": \"plugin id or null\", \"plugin_args\": {{...}} or null, \"reason\": \"why\"}}",
            describe_plugins(plugins)
        );
        let user = format!("Conversation:\n{conversation}");
        match self.classify("user_plugin", system, user, 400).await {
            Some(reply) => parse_decision(&reply)
                .unwrap_or_else(|| PluginDecision::rejected("Unparseable assessment")),
            None => PluginDecision::rejected("Assessment failed after retries"),
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    /// Assess every enabled backend in parallel and execute (or schedule)
    /// at most one task.  `None` means no task was detected at all.
    pub async fn analyze_and_execute(
        &self,
        messages: &[ChatTurn],
        lanlan_name: Option<&str>,
        flags: AgentFlags,
        gui_ready: bool,
    ) -> Option<TaskResult> {
        let task_id = Uuid::new_v4().to_string();

        if !flags.any_enabled() {
            debug!("all backends disabled, skipping dispatch");
            return None;
        }

        let conversation = Self::format_messages(messages);
        if conversation.trim().is_empty() {
            return None;
        }

        let tools = if flags.mcp_enabled {
            let tools = self.capabilities(true).await;
            info!(count = tools.len(), "mcp tools visible to dispatcher");
            tools
        } else {
            Vec::new()
        };
        let plugins = if flags.user_plugin_enabled {
            self.plugins.list(true).await
        } else {
            Vec::new()
        };
        let gui_available = flags.computer_use_enabled && gui_ready;

        let mcp_arm = async {
            if flags.mcp_enabled && !tools.is_empty() {
                Some(self.assess_mcp(&conversation, &tools).await)
            } else {
                None
            }
        };
        let gui_arm = async {
            if gui_available {
                Some(self.assess_gui(&conversation).await)
            } else {
                None
            }
        };
        let plugin_arm = async {
            if flags.user_plugin_enabled && !plugins.is_empty() {
                Some(self.assess_plugin(&conversation, &plugins).await)
            } else {
                None
            }
        };

        let (mcp_decision, gui_decision, plugin_decision) =
            tokio::join!(mcp_arm, gui_arm, plugin_arm);

        if mcp_decision.is_none() && gui_decision.is_none() && plugin_decision.is_none() {
            debug!("no assessment arms ran");
            return None;
        }

        // Priority: MCP > GUI-automation > user plugin.
        if let Some(decision) = mcp_decision.as_ref().filter(|d| d.accepted()) {
            info!(task = %decision.task_description, "dispatching via mcp");
            let result = self.execute_mcp(&task_id, decision).await;
            if result.success {
                let summary = format!(
                    "任务已完成: {}",
                    if decision.task_description.is_empty() {
                        decision.tool_name.clone().unwrap_or_default()
                    } else {
                        decision.task_description.clone()
                    }
                );
                self.notify_main(lanlan_name, &summary).await;
            }
            return Some(result);
        }

        if let Some(decision) = gui_decision.as_ref().filter(|d| d.accepted()) {
            info!(task = %decision.task_description, "scheduling gui-automation task");
            let mut result = TaskResult::new(&task_id, "gui_auto");
            result.task_description = decision.task_description.clone();
            result.reason = decision.reason.clone();
            return Some(result);
        }

        if let Some(decision) = plugin_decision.as_ref().filter(|d| d.accepted()) {
            info!(
                task = %decision.task_description,
                plugin = decision.plugin_id.as_deref().unwrap_or(""),
                "dispatching via user plugin"
            );
            return Some(self.execute_user_plugin(&task_id, decision).await);
        }

        let mut reasons = Vec::new();
        if let Some(d) = &mcp_decision {
            reasons.push(format!("MCP: {}", d.reason));
        }
        if let Some(d) = &gui_decision {
            reasons.push(format!("ComputerUse: {}", d.reason));
        }
        if let Some(d) = &plugin_decision {
            reasons.push(format!("UserPlugin: {}", d.reason));
        }

        let has_any_task = mcp_decision.as_ref().map(|d| d.has_task).unwrap_or(false)
            || gui_decision.as_ref().map(|d| d.has_task).unwrap_or(false)
            || plugin_decision.as_ref().map(|d| d.has_task).unwrap_or(false);

        if has_any_task {
            let description = mcp_decision
                .as_ref()
                .filter(|d| d.has_task)
                .map(|d| d.task_description.clone())
                .or_else(|| gui_decision.as_ref().map(|d| d.task_description.clone()))
                .unwrap_or_default();
            info!(task = %description, "task detected but no backend can execute it");
            let mut result = TaskResult::new(&task_id, "none");
            result.task_description = description;
            result.reason = if reasons.is_empty() {
                "No suitable method".to_string()
            } else {
                reasons.join(" | ")
            };
            return Some(result);
        }

        debug!("no task detected");
        None
    }

    async fn execute_mcp(&self, task_id: &str, decision: &McpDecision) -> TaskResult {
        let mut result = TaskResult::new(task_id, "mcp");
        result.task_description = decision.task_description.clone();
        result.reason = decision.reason.clone();

        let Some(tool_name) = decision.tool_name.clone().filter(|n| !n.is_empty()) else {
            result.error = Some("No tool name provided".into());
            return result;
        };
        let tool_args = decision.tool_args.clone().unwrap_or(json!({}));
        result.tool_name = Some(tool_name.clone());
        result.tool_args = Some(tool_args.clone());

        info!(tool = %tool_name, "executing mcp tool");
        match self.mcp.call_tool(&tool_name, tool_args).await {
            Ok(value) => {
                result.success = true;
                result.result = Some(value);
            }
            Err(e) => {
                error!(tool = %tool_name, "mcp tool execution failed: {e}");
                result.error = Some(e.to_string());
            }
        }
        result
    }

    async fn execute_user_plugin(&self, task_id: &str, decision: &PluginDecision) -> TaskResult {
        let mut result = TaskResult::new(task_id, "user_plugin");
        result.task_description = decision.task_description.clone();
        result.reason = decision.reason.clone();

        let Some(plugin_id) = decision.plugin_id.clone().filter(|p| !p.is_empty()) else {
            result.error = Some("No plugin_id provided".into());
            return result;
        };
        let plugin_args = decision.plugin_args.clone().unwrap_or(json!({}));
        result.tool_name = Some(plugin_id.clone());
        result.tool_args = Some(plugin_args.clone());

        // Refresh once if the cache went stale between assess and execute.
        let entry = match self.plugins.find(&plugin_id).await {
            Some(entry) => Some(entry),
            None => {
                self.plugins.list(true).await;
                self.plugins.find(&plugin_id).await
            }
        };
        let Some(entry) = entry else {
            result.error = Some(format!("Plugin {plugin_id} not found"));
            return result;
        };
        let Some(endpoint) = entry.endpoint.filter(|e| !e.is_empty()) else {
            result.error = Some(format!("Plugin {plugin_id} has no endpoint defined"));
            return result;
        };

        info!(plugin = %plugin_id, endpoint = %endpoint, "calling user plugin");
        let response = self
            .http
            .post(&endpoint)
            .timeout(PLUGIN_CALL_TIMEOUT)
            .json(&json!({ "task_id": task_id, "args": plugin_args }))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let body = match resp.text().await {
                    Ok(text) => serde_json::from_str::<Value>(&text)
                        .unwrap_or_else(|_| json!({ "raw_text": text })),
                    Err(_) => json!({}),
                };
                result.success = true;
                result.result = Some(body);
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                error!(plugin = %plugin_id, status, "plugin returned error status");
                result.error = Some(format!("Plugin returned status {status}"));
                result.result = Some(json!({ "status_code": status, "text": text }));
            }
            Err(e) => {
                error!(plugin = %plugin_id, "plugin call error: {e}");
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// Fire-and-forget task-completion notice to the main process; the text
    /// surfaces on the character's next conversational turn.
    pub async fn notify_main(&self, lanlan_name: Option<&str>, text: &str) {
        let summary = truncate_chars(text, NOTIFY_MAX_CHARS);
        let url = format!("{}/api/notify_task_result", self.main_base);
        let mut body = json!({ "text": summary });
        if let Some(name) = lanlan_name {
            body["lanlan_name"] = json!(name);
        }
        if let Err(e) = self
            .http
            .post(&url)
            .timeout(NOTIFY_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            debug!("notify_task_result failed (non-critical): {e}");
        }
    }

    /// The merged catalog in capability-map form, keyed by tool name.
    pub async fn capability_map(&self, force_refresh: bool) -> HashMap<String, Value> {
        self.capabilities(force_refresh)
            .await
            .into_iter()
            .map(|t| {
                (
                    t.name.clone(),
                    json!({
                        "title": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                        "type": "mcp_tool",
                    }),
                )
            })
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
