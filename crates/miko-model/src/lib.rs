// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Auxiliary chat-completion client.
//!
//! The realtime conversation itself runs over a dedicated WebSocket; this
//! crate covers the *side* calls the runtime makes to ordinary chat APIs:
//! backend classifiers (temperature 0, strict JSON out), the task dedup
//! judge, and one-shot vision descriptions for upstreams without native
//! image input.  Retry policy is deliberately left to callers — the
//! dispatcher owns its own `[1s, 2s]` schedule.

mod chat;
mod mock;

pub use chat::OpenAiChat;
pub use mock::MockChat;

use async_trait::async_trait;

/// One auxiliary completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Optional base64 JPEG attached as an image content part.
    pub image_b64: Option<String>,
}

impl ChatRequest {
    /// A deterministic request as used by the backend classifiers.
    pub fn classifier(system: impl Into<String>, user: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.0,
            max_tokens,
            image_b64: None,
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider/model label for logs.
    fn name(&self) -> &str;

    /// Send one completion request and return the assistant text.
    async fn complete(&self, req: ChatRequest) -> anyhow::Result<String>;
}
