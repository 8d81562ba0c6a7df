// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The realtime session object: connection lifecycle, the outgoing send
//! pipeline, and the incoming event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use miko_config::{ImageInput, UpstreamProfile};
use miko_model::{ChatModel, ChatRequest};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::audio::{AudioProcessor, FRAME_SAMPLES};
use crate::events::{parse_event, UpstreamEvent};
use crate::hooks::SessionHooks;
use crate::repetition::RepetitionDetector;
use crate::RealtimeError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const SILENCE_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const FATAL_MARKERS: [&str; 2] = ["Response timeout", "1011"];

const IMAGE_PENDING_PLACEHOLDER: &str =
    "[实时屏幕截图或相机画面正在分析中。先不要瞎编内容，可以稍等片刻。等收到画面分析结果后再描述画面。]";

#[derive(Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: Option<String>,
    pub profile: UpstreamProfile,
    pub throttle: Duration,
    pub send_window: usize,
    pub image_min_interval: Duration,
    pub silence_timeout: Duration,
}

/// Per-response bookkeeping, reset on every `response.created`.
#[derive(Default)]
struct ResponseState {
    current_response_id: Option<String>,
    is_responding: bool,
    interrupted: bool,
    skip_until_next_response: bool,
    first_text_chunk: bool,
    first_transcript_chunk: bool,
    /// The final user transcript has arrived; output transcript deltas may
    /// now flush so subtitles never run ahead of the user's line.
    print_input_transcript: bool,
    transcript_buffer: String,
    current_transcript: String,
    audio_in_buffer: bool,
    image_recognized_this_turn: bool,
    image_sent_this_turn: bool,
    image_being_analyzed: bool,
}

struct SilenceState {
    last_speech: Instant,
    triggered: bool,
}

pub struct RealtimeSession {
    config: SessionConfig,
    hooks: Arc<dyn SessionHooks>,
    vision: Option<Arc<dyn ChatModel>>,

    sink: Mutex<Option<WsSink>>,
    reader: StdMutex<Option<WsReader>>,
    state: StdMutex<ResponseState>,
    repetition: StdMutex<RepetitionDetector>,
    audio: Mutex<Option<AudioProcessor>>,

    throttled_until: StdMutex<Option<Instant>>,
    fatal: AtomicBool,
    closed: AtomicBool,
    send_sem: Semaphore,

    silence: StdMutex<SilenceState>,
    silence_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    silence_reset_pending: AtomicBool,

    last_native_image: StdMutex<Option<Instant>>,
    image_lock: Mutex<()>,
    image_description: StdMutex<String>,
}

impl RealtimeSession {
    pub fn new(
        config: SessionConfig,
        hooks: Arc<dyn SessionHooks>,
        vision: Option<Arc<dyn ChatModel>>,
    ) -> Arc<Self> {
        let send_window = config.send_window.max(1);
        Arc::new(Self {
            config,
            hooks,
            vision,
            sink: Mutex::new(None),
            reader: StdMutex::new(None),
            state: StdMutex::new(ResponseState::default()),
            repetition: StdMutex::new(RepetitionDetector::default()),
            audio: Mutex::new(Some(AudioProcessor::new())),
            throttled_until: StdMutex::new(None),
            fatal: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            send_sem: Semaphore::new(send_window),
            silence: StdMutex::new(SilenceState {
                last_speech: Instant::now(),
                triggered: false,
            }),
            silence_task: StdMutex::new(None),
            silence_reset_pending: AtomicBool::new(false),
            last_native_image: StdMutex::new(None),
            image_lock: Mutex::new(()),
            image_description: StdMutex::new(IMAGE_PENDING_PLACEHOLDER.to_string()),
        })
    }

    pub fn is_responding(&self) -> bool {
        self.state.lock().unwrap().is_responding
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ─── Connection lifecycle ────────────────────────────────────────────────

    /// Open the upstream socket and send the session configuration frame.
    pub async fn connect(
        self: &Arc<Self>,
        instructions: &str,
        native_audio: bool,
    ) -> Result<(), RealtimeError> {
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or(RealtimeError::Configuration)?;

        let url = if self.config.model == "free-model" {
            self.config.base_url.clone()
        } else {
            format!("{}?model={}", self.config.base_url, self.config.model)
        };

        let mut request = url
            .into_client_request()
            .map_err(|e| RealtimeError::UpstreamUnreachable(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| RealtimeError::Configuration)?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| RealtimeError::UpstreamUnreachable(e.to_string()))?;
        info!(model = %self.config.model, "connected to realtime upstream");

        let (sink, reader) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.reader.lock().unwrap() = Some(reader);

        {
            let mut silence = self.silence.lock().unwrap();
            silence.last_speech = Instant::now();
            silence.triggered = false;
        }
        self.spawn_silence_task();

        let profile = &self.config.profile;
        let modalities = if native_audio {
            json!(["text", "audio"])
        } else {
            json!(["text"])
        };
        let voice = self
            .config
            .voice
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| profile.default_voice.to_string());
        self.send_event(json!({
            "type": "session.update",
            "session": {
                "instructions": instructions,
                "modalities": modalities,
                "voice": voice,
                "input_audio_format": profile.input_audio_format,
                "output_audio_format": profile.output_audio_format,
                "turn_detection": { "type": "server_vad" },
            }
        }))
        .await;

        Ok(())
    }

    /// Background tick enforcing the silence timeout for aggressive-idle
    /// upstreams.  Fires the hook at most once, then exits.
    fn spawn_silence_task(self: &Arc<Self>) {
        if !self.config.profile.aggressive_idle {
            debug!(profile = self.config.profile.key, "silence timeout disabled");
            return;
        }
        let weak = Arc::downgrade(self);
        let timeout = self.config.silence_timeout;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SILENCE_CHECK_INTERVAL).await;
                let Some(session) = weak.upgrade() else { break };
                if session.is_closed() {
                    break;
                }
                let fire = {
                    let mut silence = session.silence.lock().unwrap();
                    if silence.triggered {
                        false
                    } else if silence.last_speech.elapsed() >= timeout {
                        silence.triggered = true;
                        true
                    } else {
                        false
                    }
                };
                if fire {
                    warn!(
                        timeout_secs = timeout.as_secs(),
                        "no speech within silence threshold, closing session"
                    );
                    session.hooks.on_silence_timeout().await;
                    break;
                }
            }
        });
        *self.silence_task.lock().unwrap() = Some(handle);
    }

    /// Idempotent teardown: stop the silence timer, drop the audio
    /// processor, and close the upstream socket.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.silence_task.lock().unwrap().take() {
            task.abort();
        }
        *self.audio.lock().await = None;

        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            info!("realtime connection closed");
        }
    }

    // ─── Outgoing pipeline ───────────────────────────────────────────────────

    fn is_throttled(&self) -> bool {
        matches!(*self.throttled_until.lock().unwrap(), Some(until) if Instant::now() < until)
    }

    /// Enter the throttle window.  Only the first entry per window notifies
    /// the user.
    async fn enter_throttle(&self) {
        let was_throttled = {
            let mut guard = self.throttled_until.lock().unwrap();
            let was = matches!(*guard, Some(until) if Instant::now() < until);
            *guard = Some(Instant::now() + self.config.throttle);
            was
        };
        warn!(window_ms = self.config.throttle.as_millis() as u64, "upstream overloaded, throttling");
        if !was_throttled {
            self.hooks
                .on_status_message("⚠️ 服务器繁忙，正在自动调节发送速率...")
                .await;
        }
    }

    /// Latch the fatal flag, notify once, and tear the connection down.
    async fn mark_fatal(&self, detail: &str) {
        if self.fatal.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("fatal upstream error, aborting realtime conversation: {detail}");
        self.hooks
            .on_connection_error("💥 连接超时 (Response timeout)，语音对话已中断。")
            .await;
        self.close().await;
    }

    /// Send one frame through the guarded pipeline: fatal latch, throttle
    /// window (audio appends only), socket presence, bounded concurrency.
    pub async fn send_event(&self, mut event: Value) {
        if self.fatal.load(Ordering::SeqCst) {
            return;
        }

        let kind = event["type"].as_str().unwrap_or("").to_string();
        {
            let mut guard = self.throttled_until.lock().unwrap();
            match *guard {
                Some(until) if Instant::now() < until => {
                    if kind == "input_audio_buffer.append" {
                        return;
                    }
                }
                Some(_) => {
                    *guard = None;
                    info!("throttle window ended, resuming sends");
                }
                None => {}
            }
        }

        event["event_id"] = json!(format!("event_{}", chrono::Utc::now().timestamp_millis()));

        let Ok(_permit) = self.send_sem.acquire().await else {
            return;
        };
        // The sink lock must be released before any fatal teardown, which
        // re-acquires it in close().
        let send_result = {
            let mut guard = self.sink.lock().await;
            let Some(sink) = guard.as_mut() else {
                return;
            };
            sink.send(Message::Text(event.to_string())).await
        };
        if let Err(e) = send_result {
            let msg = e.to_string();
            if !msg.contains("1000") {
                warn!(event = %kind, "failed to send event: {msg}");
            }
            if FATAL_MARKERS.iter().any(|m| msg.contains(m)) {
                self.mark_fatal(&msg).await;
            }
        }
    }

    async fn clear_audio_buffer(&self) {
        self.send_event(json!({ "type": "input_audio_buffer.clear" }))
            .await;
        debug!("sent input_audio_buffer.clear");
    }

    /// Stream one PCM chunk.  Chunks of exactly 480 samples take the
    /// high-rate desktop path through the audio processor; everything else
    /// passes through untouched.
    pub async fn stream_audio(&self, chunk: &[u8]) {
        if self.fatal.load(Ordering::SeqCst) {
            return;
        }

        let num_samples = chunk.len() / 2;
        let payload: Vec<u8> = if num_samples == FRAME_SAMPLES {
            // The processor mutex serializes chunk order; the work itself
            // runs on the blocking pool so it cannot stall the event loop.
            let mut guard = self.audio.lock().await;
            let Some(processor) = guard.take() else {
                return;
            };
            let data = chunk.to_vec();
            let processed = match tokio::task::spawn_blocking(move || {
                let mut p = processor;
                let r = p.process_chunk(&data);
                (p, r)
            })
            .await
            {
                Ok((p, r)) => {
                    *guard = Some(p);
                    r
                }
                Err(e) => {
                    error!("audio worker panicked: {e}");
                    *guard = Some(AudioProcessor::new());
                    return;
                }
            };
            drop(guard);

            if processed.silence_reset {
                self.silence_reset_pending.store(true, Ordering::SeqCst);
            }
            if processed.pcm.is_empty() {
                return;
            }
            if self.silence_reset_pending.swap(false, Ordering::SeqCst) {
                self.clear_audio_buffer().await;
            }
            processed.pcm
        } else {
            chunk.to_vec()
        };

        self.send_event(json!({
            "type": "input_audio_buffer.append",
            "audio": BASE64.encode(payload),
        }))
        .await;
    }

    /// Stream one JPEG frame.  Native-image upstreams get the raw frame
    /// (rate-limited); the rest go through the vision model at most once
    /// per conversation turn.
    pub async fn stream_image(&self, image_b64: &str) {
        if self.fatal.load(Ordering::SeqCst) {
            return;
        }

        match self.config.profile.image_input {
            ImageInput::None => self.describe_image_via_vision(image_b64).await,
            native => {
                {
                    let mut last = self.last_native_image.lock().unwrap();
                    if matches!(*last, Some(t) if t.elapsed() < self.config.image_min_interval) {
                        return;
                    }
                    *last = Some(Instant::now());
                }
                if !self.state.lock().unwrap().audio_in_buffer {
                    return;
                }
                let frame = match native {
                    ImageInput::Append { event, field } => json!({
                        "type": event,
                        field: image_b64,
                    }),
                    ImageInput::UserItem => json!({
                        "type": "conversation.item.create",
                        "item": {
                            "type": "message",
                            "role": "user",
                            "content": [{
                                "type": "input_image",
                                "image_url": format!("data:image/jpeg;base64,{image_b64}"),
                            }]
                        }
                    }),
                    ImageInput::None => unreachable!(),
                };
                self.send_event(frame).await;
            }
        }
    }

    /// Non-native image path: first frame of a turn sends the "analysis
    /// pending" placeholder and runs the vision model; one later frame sends
    /// the finished description.  Only one image is analyzed per turn.
    async fn describe_image_via_vision(&self, image_b64: &str) {
        let _guard = self.image_lock.lock().await;

        let (recognized, being_analyzed, sent) = {
            let state = self.state.lock().unwrap();
            (
                state.image_recognized_this_turn,
                state.image_being_analyzed,
                state.image_sent_this_turn,
            )
        };

        if !recognized {
            if being_analyzed {
                return;
            }
            self.state.lock().unwrap().image_being_analyzed = true;
            let placeholder = self.image_description.lock().unwrap().clone();
            self.send_user_text_item(&placeholder).await;

            let description = self.analyze_image(image_b64).await;
            {
                let mut state = self.state.lock().unwrap();
                state.image_recognized_this_turn = true;
                state.image_being_analyzed = false;
            }
            *self.image_description.lock().unwrap() = description;
        } else if !sent {
            self.state.lock().unwrap().image_sent_this_turn = true;
            let description = self.image_description.lock().unwrap().clone();
            self.send_user_text_item(&description).await;
        }
    }

    async fn analyze_image(&self, image_b64: &str) -> String {
        let Some(vision) = &self.vision else {
            warn!("no vision model configured, image dropped");
            return "[实时屏幕截图或相机画面]: 画面分析失败或暂时无法识别。".to_string();
        };
        let req = ChatRequest {
            system: "You describe screenshots and camera frames briefly and factually.".into(),
            user: "Describe what is currently visible in this frame.".into(),
            temperature: 0.2,
            max_tokens: 500,
            image_b64: Some(image_b64.to_string()),
        };
        match vision.complete(req).await {
            Ok(description) if !description.is_empty() => {
                info!("image analysis complete");
                format!("[实时屏幕截图或相机画面]: {description}")
            }
            Ok(_) => "[实时屏幕截图或相机画面]: 画面分析失败或暂时无法识别。".to_string(),
            Err(e) => {
                error!("image analysis failed: {e}");
                if e.to_string().contains("censorship") {
                    self.hooks
                        .on_status_message("⚠️ 图片内容被审查系统拦截，请尝试更换图片或内容。")
                        .await;
                }
                format!("[实时屏幕截图或相机画面]: 分析出错: {e}")
            }
        }
    }

    async fn send_user_text_item(&self, text: &str) {
        self.send_event(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }]
            }
        }))
        .await;
    }

    /// Inject a user-role text item and request a response.  With `skipped`
    /// set, the next response's deltas are dropped before reaching the user.
    pub async fn create_response(&self, extra_instructions: &str, skipped: bool) {
        if skipped {
            self.state.lock().unwrap().skip_until_next_response = true;
        }
        self.send_user_text_item(extra_instructions).await;
        info!("requesting response");
        self.send_event(json!({ "type": "response.create" })).await;
    }

    pub async fn cancel_response(&self) {
        self.send_event(json!({ "type": "response.cancel" })).await;
    }

    /// Cancel the in-flight response and suppress its remaining deltas
    /// until the next `response.created`.
    pub async fn handle_interruption(&self) {
        let cancel = {
            let mut state = self.state.lock().unwrap();
            if !state.is_responding {
                return;
            }
            state.interrupted = true;
            state.current_response_id.is_some()
        };
        info!("handling interruption");

        if cancel {
            self.cancel_response().await;
        }

        let mut state = self.state.lock().unwrap();
        state.is_responding = false;
        state.current_response_id = None;
        state.transcript_buffer.clear();
        state.first_transcript_chunk = true;
    }

    // ─── Incoming event loop ─────────────────────────────────────────────────

    /// Consume the upstream event stream until the socket closes.
    pub async fn handle_messages(self: &Arc<Self>) {
        let Some(mut reader) = self.reader.lock().unwrap().take() else {
            error!("handle_messages called before connect");
            return;
        };

        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => match parse_event(&text) {
                    Ok(event) => self.route_event(event).await,
                    Err(e) => warn!("undecodable upstream frame: {e}"),
                },
                Ok(Message::Close(frame)) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                    if code == 1011 {
                        self.mark_fatal("close code 1011").await;
                    } else {
                        info!(code, "upstream closed the connection");
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let msg = e.to_string();
                    error!("connection closed with error: {msg}");
                    if FATAL_MARKERS.iter().any(|m| msg.contains(m)) {
                        self.mark_fatal(&msg).await;
                    } else {
                        self.hooks.on_connection_error(&msg).await;
                    }
                    break;
                }
            }
            if self.is_closed() {
                break;
            }
        }
        debug!("upstream read loop ended");
    }

    pub(crate) async fn route_event(self: &Arc<Self>, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Error { message } => {
                error!("upstream error event: {message}");
                if message.contains("503") || message.to_lowercase().contains("overloaded") {
                    self.enter_throttle().await;
                } else if FATAL_MARKERS.iter().any(|m| message.contains(m)) {
                    self.mark_fatal(&message).await;
                }
            }

            UpstreamEvent::SessionCreated => {
                debug!("session configuration acknowledged");
            }

            UpstreamEvent::ResponseCreated { response_id } => {
                let mut state = self.state.lock().unwrap();
                state.current_response_id = response_id;
                state.is_responding = true;
                state.interrupted = false;
                state.first_text_chunk = true;
                state.first_transcript_chunk = true;
                state.transcript_buffer.clear();
                state.current_transcript.clear();
            }

            UpstreamEvent::OutputItemAdded { item_id } => {
                debug!(item = item_id.as_deref().unwrap_or(""), "output item added");
            }

            UpstreamEvent::ResponseDone => {
                let transcript = {
                    let mut state = self.state.lock().unwrap();
                    state.is_responding = false;
                    state.current_response_id = None;
                    state.skip_until_next_response = false;
                    state.transcript_buffer.clear();
                    state.image_recognized_this_turn = false;
                    state.image_sent_this_turn = false;
                    std::mem::take(&mut state.current_transcript)
                };
                *self.image_description.lock().unwrap() = IMAGE_PENDING_PLACEHOLDER.to_string();

                if !transcript.is_empty() {
                    let repeated = self.repetition.lock().unwrap().observe(&transcript);
                    if repeated {
                        warn!("high-similarity responses detected across consecutive turns");
                        self.hooks.on_repetition_detected().await;
                    }
                }
                self.hooks.on_response_done().await;
            }

            UpstreamEvent::SpeechStarted => {
                info!("speech detected");
                let responding = {
                    let mut state = self.state.lock().unwrap();
                    state.audio_in_buffer = true;
                    state.is_responding
                };
                self.silence.lock().unwrap().last_speech = Instant::now();
                if responding {
                    self.handle_interruption().await;
                }
            }

            UpstreamEvent::SpeechStopped => {
                info!("speech ended");
                self.state.lock().unwrap().audio_in_buffer = false;
                self.hooks.on_new_message().await;
            }

            UpstreamEvent::InputTranscriptCompleted { transcript } => {
                let suppressed = {
                    let mut state = self.state.lock().unwrap();
                    state.print_input_transcript = true;
                    state.skip_until_next_response || state.interrupted
                };
                if !suppressed {
                    self.hooks.on_input_transcript(&transcript).await;
                }
            }

            UpstreamEvent::TextDelta { delta } => {
                let first = {
                    let mut state = self.state.lock().unwrap();
                    if state.skip_until_next_response || state.interrupted {
                        return;
                    }
                    let first = state.first_text_chunk;
                    state.first_text_chunk = false;
                    first
                };
                self.hooks.on_text_delta(&delta, first).await;
            }

            UpstreamEvent::AudioDelta { delta_b64 } => {
                {
                    let state = self.state.lock().unwrap();
                    if state.skip_until_next_response || state.interrupted {
                        return;
                    }
                }
                match BASE64.decode(delta_b64.as_bytes()) {
                    Ok(pcm) => self.hooks.on_audio_delta(pcm).await,
                    Err(e) => warn!("undecodable audio delta: {e}"),
                }
            }

            UpstreamEvent::AudioTranscriptDelta { delta } => {
                // Buffer assistant transcript until the user's final
                // transcript has been shown, then flush in order.
                let flush = {
                    let mut state = self.state.lock().unwrap();
                    if state.skip_until_next_response || state.interrupted {
                        return;
                    }
                    state.current_transcript.push_str(&delta);
                    if !state.print_input_transcript {
                        state.transcript_buffer.push_str(&delta);
                        None
                    } else {
                        let buffered = std::mem::take(&mut state.transcript_buffer);
                        let first = state.first_transcript_chunk;
                        state.first_transcript_chunk = false;
                        Some((buffered, first))
                    }
                };
                if let Some((buffered, mut first)) = flush {
                    if !buffered.is_empty() {
                        self.hooks.on_output_transcript(&buffered, first).await;
                        first = false;
                    }
                    self.hooks.on_output_transcript(&delta, first).await;
                }
            }

            UpstreamEvent::AudioTranscriptDone { transcript } => {
                let emit = {
                    let mut state = self.state.lock().unwrap();
                    state.print_input_transcript = false;
                    state.transcript_buffer.clear();
                    if state.skip_until_next_response || state.interrupted {
                        return;
                    }
                    let first = state.first_transcript_chunk;
                    if first && !transcript.is_empty() {
                        state.first_transcript_chunk = false;
                        true
                    } else {
                        false
                    }
                };
                if emit {
                    self.hooks.on_output_transcript(&transcript, true).await;
                }
            }

            UpstreamEvent::Unknown { kind } => {
                debug!(kind, "ignoring unrecognized upstream event");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use miko_config::lookup_profile;

    /// Hooks that record every callback invocation.
    #[derive(Default)]
    struct Recorder {
        log: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
        fn count(&self, prefix: &str) -> usize {
            self.entries()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl SessionHooks for Recorder {
        async fn on_text_delta(&self, delta: &str, first_chunk: bool) {
            self.push(format!("text:{delta}:{first_chunk}"));
        }
        async fn on_audio_delta(&self, pcm: Vec<u8>) {
            self.push(format!("audio:{}", pcm.len()));
        }
        async fn on_input_transcript(&self, text: &str) {
            self.push(format!("input:{text}"));
        }
        async fn on_output_transcript(&self, text: &str, first_chunk: bool) {
            self.push(format!("transcript:{text}:{first_chunk}"));
        }
        async fn on_new_message(&self) {
            self.push("new_message".into());
        }
        async fn on_response_done(&self) {
            self.push("done".into());
        }
        async fn on_status_message(&self, text: &str) {
            self.push(format!("status:{text}"));
        }
        async fn on_connection_error(&self, text: &str) {
            self.push(format!("conn_error:{text}"));
        }
        async fn on_repetition_detected(&self) {
            self.push("repetition".into());
        }
    }

    fn session_with_recorder() -> (Arc<RealtimeSession>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = SessionConfig {
            base_url: "wss://unused.example".into(),
            api_key: Some("sk-test".into()),
            model: "qwen-omni-turbo-realtime".into(),
            voice: None,
            profile: lookup_profile(None, "qwen-omni-turbo-realtime"),
            throttle: Duration::from_millis(200),
            send_window: 25,
            image_min_interval: Duration::from_millis(1500),
            silence_timeout: Duration::from_secs(90),
        };
        let session = RealtimeSession::new(config, recorder.clone(), None);
        (session, recorder)
    }

    fn created() -> UpstreamEvent {
        UpstreamEvent::ResponseCreated {
            response_id: Some("resp_1".into()),
        }
    }

    #[tokio::test]
    async fn connect_without_key_is_configuration_error() {
        let recorder = Arc::new(Recorder::default());
        let config = SessionConfig {
            base_url: "wss://unused.example".into(),
            api_key: None,
            model: "qwen".into(),
            voice: None,
            profile: lookup_profile(None, "qwen"),
            throttle: Duration::from_secs(2),
            send_window: 25,
            image_min_interval: Duration::from_secs(1),
            silence_timeout: Duration::from_secs(90),
        };
        let session = RealtimeSession::new(config, recorder, None);
        let err = session.connect("hi", true).await.unwrap_err();
        assert!(matches!(err, RealtimeError::Configuration));
    }

    #[tokio::test]
    async fn text_deltas_set_first_chunk_exactly_once() {
        let (session, recorder) = session_with_recorder();
        session.route_event(created()).await;
        session
            .route_event(UpstreamEvent::TextDelta { delta: "a".into() })
            .await;
        session
            .route_event(UpstreamEvent::TextDelta { delta: "b".into() })
            .await;
        assert_eq!(
            recorder.entries(),
            vec!["text:a:true".to_string(), "text:b:false".to_string()]
        );
    }

    #[tokio::test]
    async fn response_done_clears_responding_and_fires_hook() {
        let (session, recorder) = session_with_recorder();
        session.route_event(created()).await;
        assert!(session.is_responding());
        session.route_event(UpstreamEvent::ResponseDone).await;
        assert!(!session.is_responding());
        assert_eq!(recorder.count("done"), 1);
    }

    #[tokio::test]
    async fn interruption_suppresses_remaining_deltas() {
        let (session, recorder) = session_with_recorder();
        session.route_event(created()).await;
        // Speech while responding triggers the interruption path.
        session.route_event(UpstreamEvent::SpeechStarted).await;
        assert!(!session.is_responding());

        session
            .route_event(UpstreamEvent::TextDelta { delta: "late".into() })
            .await;
        session
            .route_event(UpstreamEvent::AudioDelta {
                delta_b64: BASE64.encode(b"xxxx"),
            })
            .await;
        assert_eq!(recorder.count("text:"), 0);
        assert_eq!(recorder.count("audio:"), 0);

        // The next response lifts the suppression.
        session.route_event(created()).await;
        session
            .route_event(UpstreamEvent::TextDelta { delta: "ok".into() })
            .await;
        assert_eq!(recorder.entries().last().unwrap(), "text:ok:true");
    }

    #[tokio::test]
    async fn speech_started_while_idle_does_not_interrupt() {
        let (session, recorder) = session_with_recorder();
        session.route_event(UpstreamEvent::SpeechStarted).await;
        session.route_event(UpstreamEvent::SpeechStopped).await;
        assert_eq!(recorder.count("new_message"), 1);
    }

    #[tokio::test]
    async fn skipped_response_drops_deltas_until_done() {
        let (session, recorder) = session_with_recorder();
        session.create_response("context update", true).await;
        session.route_event(created()).await;
        session
            .route_event(UpstreamEvent::TextDelta {
                delta: "hidden".into(),
            })
            .await;
        assert_eq!(recorder.count("text:"), 0);

        session.route_event(UpstreamEvent::ResponseDone).await;
        session.route_event(created()).await;
        session
            .route_event(UpstreamEvent::TextDelta {
                delta: "visible".into(),
            })
            .await;
        assert_eq!(recorder.count("text:"), 1);
    }

    #[tokio::test]
    async fn overload_error_enters_throttle_and_notifies_once() {
        let (session, recorder) = session_with_recorder();
        session
            .route_event(UpstreamEvent::Error {
                message: "503 service overloaded".into(),
            })
            .await;
        assert!(session.is_throttled());
        session
            .route_event(UpstreamEvent::Error {
                message: "overloaded again".into(),
            })
            .await;
        assert_eq!(recorder.count("status:"), 1);
    }

    #[tokio::test]
    async fn throttle_window_expires() {
        let (session, _recorder) = session_with_recorder();
        session
            .route_event(UpstreamEvent::Error {
                message: "503".into(),
            })
            .await;
        assert!(session.is_throttled());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!session.is_throttled());
    }

    #[tokio::test]
    async fn response_timeout_is_fatal_and_notifies_once() {
        let (session, recorder) = session_with_recorder();
        session
            .route_event(UpstreamEvent::Error {
                message: "Response timeout".into(),
            })
            .await;
        session
            .route_event(UpstreamEvent::Error {
                message: "Response timeout".into(),
            })
            .await;
        assert!(session.is_closed());
        assert_eq!(recorder.count("conn_error:"), 1);
    }

    #[tokio::test]
    async fn repetition_detected_once_after_three_similar_responses() {
        let (session, recorder) = session_with_recorder();
        for _ in 0..3 {
            session.route_event(created()).await;
            session
                .route_event(UpstreamEvent::AudioTranscriptDelta {
                    delta: "我已经说过了哦".into(),
                })
                .await;
            session.route_event(UpstreamEvent::ResponseDone).await;
        }
        assert_eq!(recorder.count("repetition"), 1);
    }

    #[tokio::test]
    async fn output_transcript_waits_for_input_transcript() {
        let (session, recorder) = session_with_recorder();
        session.route_event(created()).await;
        session
            .route_event(UpstreamEvent::AudioTranscriptDelta {
                delta: "早上".into(),
            })
            .await;
        // Buffered: the user's transcript has not arrived yet.
        assert_eq!(recorder.count("transcript:"), 0);

        session
            .route_event(UpstreamEvent::InputTranscriptCompleted {
                transcript: "こんにちは".into(),
            })
            .await;
        session
            .route_event(UpstreamEvent::AudioTranscriptDelta {
                delta: "好".into(),
            })
            .await;
        let entries = recorder.entries();
        assert!(entries.contains(&"transcript:早上:true".to_string()));
        assert!(entries.contains(&"transcript:好:false".to_string()));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _) = session_with_recorder();
        session.close().await;
        session.close().await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn stream_audio_after_fatal_is_noop() {
        let (session, _) = session_with_recorder();
        session.mark_fatal("Response timeout").await;
        // No socket, no panic, nothing to observe except absence of effects.
        session.stream_audio(&[0u8; FRAME_SAMPLES * 2]).await;
    }
}
