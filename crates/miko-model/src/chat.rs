// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{ChatModel, ChatRequest};

/// OpenAI-compatible `/chat/completions` client, non-streaming.
///
/// Classifier and dedup calls need whole response bodies (they parse strict
/// JSON out of the content), so there is no SSE path here.
pub struct OpenAiChat {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    /// `base_url` ends before `/chat/completions`, e.g.
    /// `https://openrouter.ai/api/v1`.
    pub fn new(base_url: &str, model: impl Into<String>, api_key: Option<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model: model.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            client: reqwest::Client::new(),
        }
    }

    fn user_content(req: &ChatRequest) -> Value {
        match &req.image_b64 {
            None => json!(req.user),
            Some(b64) => json!([
                { "type": "text", "text": req.user },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/jpeg;base64,{b64}") }
                }
            ]),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: ChatRequest) -> anyhow::Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": req.system },
                { "role": "user", "content": Self::user_content(&req) },
            ],
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });

        debug!(model = %self.model, "sending auxiliary completion request");

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.model))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.model);
        }

        let body: Value = resp.json().await.context("decoding completion body")?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .context("completion body missing choices[0].message.content")?;
        Ok(content.trim().to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_url_derived_from_base() {
        let c = OpenAiChat::new("https://api.example.com/v1/", "m", None);
        assert_eq!(c.chat_url, "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn user_content_plain_text() {
        let req = ChatRequest::classifier("s", "hello", 100);
        let v = OpenAiChat::user_content(&req);
        assert_eq!(v.as_str(), Some("hello"));
    }

    #[test]
    fn user_content_with_image_is_two_parts() {
        let mut req = ChatRequest::classifier("s", "describe", 100);
        req.image_b64 = Some("QUJD".into());
        let v = OpenAiChat::user_content(&req);
        let parts = v.as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["type"].as_str(), Some("image_url"));
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
    }
}
