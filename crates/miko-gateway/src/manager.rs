// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-character session manager.
//!
//! Owns at most one realtime session for its character and bridges that
//! session's callbacks to three consumers: the user's WebSocket (deltas,
//! transcripts, status lines), the monitor process (subtitle/telemetry
//! frames via the character's sync queue), and the agent process (the
//! conversation window posted to `/analyze_and_plan` after every assistant
//! turn).  Task-result notices accumulate in `pending_extra_replies` and
//! surface as an extra reply after the next completed turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use miko_config::{lookup_profile, Config};
use miko_model::ChatModel;
use miko_realtime::{RealtimeSession, SessionConfig, SessionHooks};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Turns kept for the analyzer window and the recent-conversation snapshot.
const RECENT_TURNS: usize = 20;

const MEMORY_FETCH_TIMEOUT: Duration = Duration::from_secs(2);
const ANALYZE_TIMEOUT: Duration = Duration::from_secs(2);

const REPETITION_NUDGE: &str = "（系统提示：你的回复出现了重复，请换个话题或者换种说法。）";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Audio,
    Text,
}

impl InputMode {
    /// `audio`, `screen`, and `camera` sessions all speak audio upstream;
    /// only `text` starts a text-modality session.
    pub fn from_input_type(input_type: &str) -> Option<Self> {
        match input_type {
            "audio" | "screen" | "camera" => Some(InputMode::Audio),
            "text" => Some(InputMode::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub text: String,
}

pub struct SessionManager {
    pub name: String,
    prompt: StdMutex<String>,
    voice_id: StdMutex<Option<String>>,
    model_override: Option<String>,

    session: Mutex<Option<Arc<RealtimeSession>>>,
    is_active: AtomicBool,
    idle: AtomicBool,
    input_mode: StdMutex<InputMode>,

    pub pending_extra_replies: StdMutex<Vec<String>>,
    user_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    monitor_tx: std::sync::mpsc::Sender<Value>,
    recent: StdMutex<Vec<Turn>>,
    current_reply: StdMutex<String>,

    config: Arc<Config>,
    vision: Option<Arc<dyn ChatModel>>,
    http: reqwest::Client,
}

impl SessionManager {
    pub fn new(
        name: String,
        prompt: String,
        voice_id: Option<String>,
        model_override: Option<String>,
        config: Arc<Config>,
        monitor_tx: std::sync::mpsc::Sender<Value>,
        vision: Option<Arc<dyn ChatModel>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            prompt: StdMutex::new(prompt),
            voice_id: StdMutex::new(voice_id),
            model_override,
            session: Mutex::new(None),
            is_active: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            input_mode: StdMutex::new(InputMode::Audio),
            pending_extra_replies: StdMutex::new(Vec::new()),
            user_tx: StdMutex::new(None),
            monitor_tx,
            recent: StdMutex::new(Vec::new()),
            current_reply: StdMutex::new(String::new()),
            config,
            vision,
            http: reqwest::Client::new(),
        })
    }

    // ─── Configuration mutation (hot reload) ─────────────────────────────────

    pub fn set_prompt(&self, prompt: String) {
        *self.prompt.lock().unwrap() = prompt;
    }

    pub fn set_voice_id(&self, voice_id: Option<String>) {
        *self.voice_id.lock().unwrap() = voice_id;
    }

    pub fn voice_id(&self) -> Option<String> {
        self.voice_id.lock().unwrap().clone()
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    /// A paused session counts as idle for UX purposes; the next
    /// `start_session` clears it.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn force_active(&self, active: bool) {
        self.is_active.store(active, Ordering::SeqCst);
    }

    // ─── User socket plumbing ────────────────────────────────────────────────

    pub fn attach_user(&self, tx: mpsc::UnboundedSender<String>) {
        *self.user_tx.lock().unwrap() = Some(tx);
    }

    /// Detach only if `tx` is still the attached sender; a newer connection
    /// keeps its channel.
    pub fn detach_user(&self, tx: &mpsc::UnboundedSender<String>) {
        let mut guard = self.user_tx.lock().unwrap();
        if matches!(guard.as_ref(), Some(current) if current.same_channel(tx)) {
            *guard = None;
        }
    }

    pub fn user_sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.user_tx.lock().unwrap().clone()
    }

    pub fn send_user(&self, frame: Value) {
        if let Some(tx) = self.user_tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame.to_string());
        }
    }

    pub fn send_status(&self, message: &str) {
        self.send_user(json!({ "type": "status", "message": message }));
    }

    fn send_monitor(&self, frame: Value) {
        let _ = self.monitor_tx.send(frame);
    }

    // ─── Pending extra replies ───────────────────────────────────────────────

    pub fn push_extra_reply(&self, text: String) {
        self.pending_extra_replies.lock().unwrap().push(text);
    }

    pub fn take_pending_replies(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending_extra_replies.lock().unwrap())
    }

    // ─── Session lifecycle ───────────────────────────────────────────────────

    /// Open a realtime session, replacing any existing one.  With
    /// `new_session` the conversation window restarts from scratch.
    pub async fn start_session(
        self: &Arc<Self>,
        new_session: bool,
        mode: InputMode,
    ) -> anyhow::Result<()> {
        self.end_session().await;

        if new_session {
            self.recent.lock().unwrap().clear();
        }
        *self.input_mode.lock().unwrap() = mode;
        self.set_idle(false);

        let memory_context = self.fetch_memory_context().await;
        let instructions = {
            let prompt = self.prompt.lock().unwrap().clone();
            if memory_context.is_empty() {
                prompt
            } else {
                format!("{prompt}\n{memory_context}")
            }
        };

        let realtime = &self.config.realtime;
        let model = self
            .model_override
            .clone()
            .unwrap_or_else(|| realtime.model.clone());
        let session_config = SessionConfig {
            base_url: realtime.base_url.clone(),
            api_key: realtime.resolve_api_key(),
            voice: self.voice_id().or_else(|| realtime.voice.clone()),
            profile: lookup_profile(realtime.profile.as_deref(), &model),
            model,
            throttle: Duration::from_millis(realtime.throttle_ms),
            send_window: realtime.send_window,
            image_min_interval: Duration::from_millis(realtime.image_min_interval_ms),
            silence_timeout: Duration::from_secs(realtime.silence_timeout_secs),
        };

        let hooks: Arc<dyn SessionHooks> = Arc::new(ManagerHooks {
            manager: Arc::downgrade(self),
        });
        let session = RealtimeSession::new(session_config, hooks, self.vision.clone());
        session
            .connect(&instructions, mode == InputMode::Audio)
            .await?;

        let reader = session.clone();
        tokio::spawn(async move {
            reader.handle_messages().await;
        });

        *self.session.lock().await = Some(session);
        self.is_active.store(true, Ordering::SeqCst);
        info!(character = %self.name, ?mode, "realtime session started");

        // Task results that arrived between sessions surface immediately.
        self.flush_pending_replies().await;
        Ok(())
    }

    /// Graceful close.  Safe to call twice; the second call is a no-op.
    pub async fn end_session(&self) {
        let Some(session) = self.session.lock().await.take() else {
            self.is_active.store(false, Ordering::SeqCst);
            return;
        };
        session.close().await;
        self.is_active.store(false, Ordering::SeqCst);
        *self.current_reply.lock().unwrap() = String::new();
        info!(character = %self.name, "realtime session ended");
    }

    /// Route one media frame from the user socket into the session.
    pub async fn stream_data(&self, payload: Value) {
        let session = {
            let guard = self.session.lock().await;
            guard.clone()
        };
        let Some(session) = session else {
            debug!(character = %self.name, "stream_data without active session");
            return;
        };

        if let Some(audio_b64) = payload["audio"].as_str() {
            match BASE64.decode(audio_b64.as_bytes()) {
                Ok(pcm) => session.stream_audio(&pcm).await,
                Err(e) => warn!("undecodable audio payload: {e}"),
            }
        }
        if let Some(image_b64) = payload["image"].as_str() {
            session.stream_image(image_b64).await;
        }
        if let Some(text) = payload["text"].as_str().filter(|t| !t.is_empty()) {
            self.record_turn("user", text);
            session.create_response(text, false).await;
        }
    }

    // ─── Conversation bookkeeping ────────────────────────────────────────────

    fn record_turn(&self, role: &str, text: &str) {
        let mut recent = self.recent.lock().unwrap();
        recent.push(Turn {
            role: role.to_string(),
            text: text.to_string(),
        });
        let len = recent.len();
        if len > RECENT_TURNS {
            recent.drain(..len - RECENT_TURNS);
        }
    }

    pub fn recent_turns(&self) -> Vec<Turn> {
        self.recent.lock().unwrap().clone()
    }

    /// Write the recent-conversation snapshot consumed by the memory
    /// service.  Best-effort; a write failure only logs.
    fn persist_recent(&self) {
        let turns = self.recent_turns();
        let path = format!("recent_{}.json", self.name);
        match serde_json::to_string_pretty(&turns) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&path, body) {
                    warn!(path, "failed to write recent snapshot: {e}");
                }
            }
            Err(e) => warn!("failed to serialize recent snapshot: {e}"),
        }
    }

    async fn fetch_memory_context(&self) -> String {
        let url = format!(
            "{}/new_dialog/{}",
            self.config.ports.memory_url(),
            self.name
        );
        match self
            .http
            .get(&url)
            .timeout(MEMORY_FETCH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
            Ok(resp) => {
                debug!(status = %resp.status(), "memory context fetch rejected");
                String::new()
            }
            Err(e) => {
                debug!("memory context fetch failed: {e}");
                String::new()
            }
        }
    }

    /// Post the conversation window to the agent process; fire-and-forget.
    fn spawn_analysis(&self) {
        let turns = self.recent_turns();
        if turns.is_empty() {
            return;
        }
        let url = format!("{}/analyze_and_plan", self.config.ports.agent_url());
        let body = json!({
            "messages": turns,
            "lanlan_name": self.name,
        });
        let http = self.http.clone();
        tokio::spawn(async move {
            if let Err(e) = http
                .post(&url)
                .timeout(ANALYZE_TIMEOUT)
                .json(&body)
                .send()
                .await
            {
                debug!("analyze_and_plan post failed (non-critical): {e}");
            }
        });
    }

    /// Surface queued task-result notices as one extra reply.
    async fn flush_pending_replies(&self) {
        let pending = self.take_pending_replies();
        if pending.is_empty() {
            return;
        }
        let session = self.session.lock().await.clone();
        if let Some(session) = session {
            session.create_response(&pending.join("\n"), false).await;
        } else {
            // No session to speak through; keep them for the next one.
            let mut guard = self.pending_extra_replies.lock().unwrap();
            let mut restored = pending;
            restored.extend(guard.drain(..));
            *guard = restored;
        }
    }
}

// ─── Session hooks bridge ────────────────────────────────────────────────────

struct ManagerHooks {
    manager: Weak<SessionManager>,
}

impl ManagerHooks {
    fn upgrade(&self) -> Option<Arc<SessionManager>> {
        self.manager.upgrade()
    }
}

#[async_trait]
impl SessionHooks for ManagerHooks {
    async fn on_text_delta(&self, delta: &str, first_chunk: bool) {
        let Some(mgr) = self.upgrade() else { return };
        mgr.send_user(json!({ "type": "text", "delta": delta, "first_chunk": first_chunk }));
        mgr.current_reply.lock().unwrap().push_str(delta);
        if *mgr.input_mode.lock().unwrap() == InputMode::Text {
            mgr.send_monitor(json!({ "type": "gemini_response", "text": delta }));
        }
    }

    async fn on_audio_delta(&self, pcm: Vec<u8>) {
        let Some(mgr) = self.upgrade() else { return };
        mgr.send_user(json!({ "type": "audio", "data": BASE64.encode(&pcm) }));
    }

    async fn on_input_transcript(&self, text: &str) {
        let Some(mgr) = self.upgrade() else { return };
        mgr.record_turn("user", text);
        mgr.send_user(json!({ "type": "user_transcript", "text": text }));
    }

    async fn on_output_transcript(&self, text: &str, first_chunk: bool) {
        let Some(mgr) = self.upgrade() else { return };
        mgr.send_user(json!({ "type": "transcript", "text": text, "first_chunk": first_chunk }));
        mgr.current_reply.lock().unwrap().push_str(text);
        mgr.send_monitor(json!({ "type": "gemini_response", "text": text }));
    }

    async fn on_new_message(&self) {
        let Some(mgr) = self.upgrade() else { return };
        mgr.send_user(json!({ "type": "new_message" }));
    }

    async fn on_response_done(&self) {
        let Some(mgr) = self.upgrade() else { return };

        let reply = std::mem::take(&mut *mgr.current_reply.lock().unwrap());
        if !reply.is_empty() {
            mgr.record_turn("assistant", &reply);
        }
        mgr.send_user(json!({ "type": "response_done" }));
        mgr.send_monitor(json!({ "type": "turn end" }));
        mgr.persist_recent();
        mgr.spawn_analysis();
        mgr.flush_pending_replies().await;
    }

    async fn on_silence_timeout(&self) {
        let Some(mgr) = self.upgrade() else { return };
        warn!(character = %mgr.name, "silence timeout, closing session");
        mgr.send_status("长时间没有检测到语音输入，会话已自动关闭。");
        mgr.end_session().await;
    }

    async fn on_status_message(&self, text: &str) {
        let Some(mgr) = self.upgrade() else { return };
        mgr.send_status(text);
    }

    async fn on_connection_error(&self, text: &str) {
        let Some(mgr) = self.upgrade() else { return };
        error!(character = %mgr.name, "connection error: {text}");
        mgr.send_status(text);
        mgr.end_session().await;
    }

    async fn on_repetition_detected(&self) {
        let Some(mgr) = self.upgrade() else { return };
        warn!(character = %mgr.name, "repetition detected, nudging conversation");
        let session = mgr.session.lock().await.clone();
        if let Some(session) = session {
            session.create_response(REPETITION_NUDGE, false).await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SessionManager> {
        let (tx, _rx) = std::sync::mpsc::channel();
        SessionManager::new(
            "momo".into(),
            "You are Momo.".into(),
            Some("voice-1".into()),
            None,
            Arc::new(Config::default()),
            tx,
            None,
        )
    }

    #[test]
    fn input_mode_parsing() {
        assert_eq!(InputMode::from_input_type("audio"), Some(InputMode::Audio));
        assert_eq!(InputMode::from_input_type("screen"), Some(InputMode::Audio));
        assert_eq!(InputMode::from_input_type("camera"), Some(InputMode::Audio));
        assert_eq!(InputMode::from_input_type("text"), Some(InputMode::Text));
        assert_eq!(InputMode::from_input_type("telepathy"), None);
    }

    #[test]
    fn pending_replies_accumulate_and_drain() {
        let mgr = manager();
        mgr.push_extra_reply("任务已完成: timer".into());
        mgr.push_extra_reply("任务已完成: search".into());
        let drained = mgr.take_pending_replies();
        assert_eq!(drained.len(), 2);
        assert!(mgr.take_pending_replies().is_empty());
    }

    #[test]
    fn record_turn_caps_window() {
        let mgr = manager();
        for i in 0..50 {
            mgr.record_turn("user", &format!("m{i}"));
        }
        let turns = mgr.recent_turns();
        assert_eq!(turns.len(), RECENT_TURNS);
        assert_eq!(turns.last().unwrap().text, "m49");
        assert_eq!(turns.first().unwrap().text, "m30");
    }

    #[test]
    fn detach_user_only_removes_own_channel() {
        let mgr = manager();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        mgr.attach_user(tx1.clone());
        mgr.attach_user(tx2.clone());
        // tx1 was superseded; detaching it must not clear tx2.
        mgr.detach_user(&tx1);
        mgr.send_status("still connected");
        assert!(rx2.try_recv().is_ok());

        mgr.detach_user(&tx2);
        assert!(mgr.user_sender().is_none());
    }

    #[test]
    fn hot_reload_mutates_prompt_and_voice_in_place() {
        let mgr = manager();
        mgr.set_prompt("updated prompt".into());
        mgr.set_voice_id(Some("voice-2".into()));
        assert_eq!(mgr.voice_id().as_deref(), Some("voice-2"));
    }

    #[tokio::test]
    async fn end_session_without_session_is_noop() {
        let mgr = manager();
        mgr.end_session().await;
        mgr.end_session().await;
        assert!(!mgr.is_active());
    }

    #[tokio::test]
    async fn flush_without_session_restores_pending() {
        let mgr = manager();
        mgr.push_extra_reply("任务已完成: timer".into());
        mgr.flush_pending_replies().await;
        // No session to speak through: the notice must survive for later.
        assert_eq!(mgr.pending_extra_replies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_data_without_session_is_ignored() {
        let mgr = manager();
        mgr.stream_data(json!({"text": "hello"})).await;
        assert!(mgr.recent_turns().is_empty());
    }
}
