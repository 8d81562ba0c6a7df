// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

/// Callbacks from a realtime session to its owner.
///
/// The session never talks to the user directly — every user-visible
/// effect goes through these hooks, so the owning layer decides how deltas
/// reach the frontend, what a repetition loop should trigger, and when a
/// broken connection ends the conversation.  All methods default to no-ops
/// so implementors only override what they consume.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// A text delta from the assistant.  `first_chunk` is set exactly once
    /// per response, on the first non-suppressed delta.
    async fn on_text_delta(&self, _delta: &str, _first_chunk: bool) {}

    /// Decoded PCM from the assistant.
    async fn on_audio_delta(&self, _pcm: Vec<u8>) {}

    /// Final transcript of what the user said.
    async fn on_input_transcript(&self, _text: &str) {}

    /// Transcript of what the assistant is saying, as it is spoken.
    async fn on_output_transcript(&self, _text: &str, _first_chunk: bool) {}

    /// The user stopped speaking; a new message boundary.
    async fn on_new_message(&self) {}

    /// The current assistant response finished.
    async fn on_response_done(&self) {}

    /// The silence timeout elapsed; the owner should close the session.
    async fn on_silence_timeout(&self) {}

    /// A transient status line worth showing to the user.
    async fn on_status_message(&self, _text: &str) {}

    /// The connection failed fatally; one notification per session.
    async fn on_connection_error(&self, _text: &str) {}

    /// The last responses were near-duplicates of each other.  The session
    /// has already cleared its ring buffer; acting on it is the owner's
    /// call (typically a nudge message into the conversation).
    async fn on_repetition_detected(&self) {}
}

/// No-op hooks for tests and detached sessions.
pub struct NullHooks;

#[async_trait]
impl SessionHooks for NullHooks {}
