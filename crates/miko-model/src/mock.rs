// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;

use crate::{ChatModel, ChatRequest};

/// Scripted chat model for tests.
///
/// Responses are popped in FIFO order; every received request is recorded so
/// assertions can inspect the prompts that were actually sent.  An exhausted
/// queue is an error — tests should script exactly as many responses as the
/// code under test will request.
#[derive(Default)]
pub struct MockChat {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(text.into()));
    }

    pub fn push_err(&self, msg: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(msg.into()));
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for MockChat {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, req: ChatRequest) -> anyhow::Result<String> {
        self.requests.lock().unwrap().push(req);
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(msg)) => bail!("{msg}"),
            None => bail!("MockChat: response queue exhausted"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
