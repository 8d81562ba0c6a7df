// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Realtime session core.
//!
//! One [`RealtimeSession`] owns the duplex WebSocket to the upstream
//! realtime LLM for a single conversation: it pre-processes outgoing audio
//! (noise reduction, silence detection), routes incoming deltas and
//! transcripts to a [`SessionHooks`] implementation, and defends the
//! connection against upstream overload (throttle window), fatal errors
//! (latch and tear down), repetition loops, and long-idle sessions.
//!
//! A session object is single-use: once closed it stays closed, and the next
//! conversation gets a fresh instance.

mod audio;
mod events;
mod hooks;
mod repetition;
mod session;

pub use audio::{AudioProcessor, ProcessedChunk, FRAME_SAMPLES};
pub use events::{parse_event, UpstreamEvent};
pub use hooks::{NullHooks, SessionHooks};
pub use repetition::RepetitionDetector;
pub use session::{RealtimeSession, SessionConfig};

/// Errors surfaced to the caller of [`RealtimeSession::connect`].
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// No API credentials available; the session never starts.
    #[error("missing realtime API credentials")]
    Configuration,
    #[error("failed to reach realtime upstream: {0}")]
    UpstreamUnreachable(String),
}
