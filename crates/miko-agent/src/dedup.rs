// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! LLM-backed duplicate detection for incoming task requests.
//!
//! "Set a timer for five minutes" and "start a 5 min countdown" are the same
//! task; string comparison cannot see that, so an auxiliary model judges the
//! new query against every queued/running task for the character.  The
//! judge is inherently non-deterministic — tests script it through
//! [`miko_model::MockChat`].

use std::sync::Arc;

use miko_model::{ChatModel, ChatRequest};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::decision::parse_decision;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DedupVerdict {
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub matched_id: Option<String>,
}

pub struct TaskDeduper {
    model: Arc<dyn ChatModel>,
}

impl TaskDeduper {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Judge whether `query` duplicates any of `candidates`
    /// (`(task_id, description)` pairs).  Any judge failure resolves to
    /// "not a duplicate" — dropping real work is worse than occasionally
    /// running it twice.
    pub async fn judge(&self, query: &str, candidates: &[(String, String)]) -> DedupVerdict {
        if candidates.is_empty() {
            return DedupVerdict::default();
        }

        let listing: String = candidates
            .iter()
            .map(|(id, desc)| format!("- {id}: {desc}"))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "You judge whether a new task request duplicates an existing task.\n\
             EXISTING TASKS (id: description):\n{listing}\n\n\
             Reply with ONLY a JSON object: {{\"duplicate\": boolean, \"matched_id\": \"id or null\"}}.\n\
             Two requests duplicate each other when completing one would make the other pointless."
        );
        let user = format!("New request: {query}");

        match self
            .model
            .complete(ChatRequest::classifier(system, user, 200))
            .await
        {
            Ok(reply) => {
                let verdict: DedupVerdict = parse_decision(&reply).unwrap_or_default();
                debug!(
                    duplicate = verdict.duplicate,
                    matched = verdict.matched_id.as_deref().unwrap_or(""),
                    "dedup verdict"
                );
                verdict
            }
            Err(e) => {
                warn!("dedup judge failed, treating as not duplicate: {e}");
                DedupVerdict::default()
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use miko_model::MockChat;

    fn candidates() -> Vec<(String, String)> {
        vec![
            ("t1".to_string(), "set a timer for 5 minutes".to_string()),
            ("t2".to_string(), "open chrome".to_string()),
        ]
    }

    #[tokio::test]
    async fn empty_candidates_short_circuit_without_model_call() {
        let mock = Arc::new(MockChat::new());
        let deduper = TaskDeduper::new(mock.clone());
        let verdict = deduper.judge("anything", &[]).await;
        assert!(!verdict.duplicate);
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn duplicate_verdict_carries_matched_id() {
        let mock = Arc::new(MockChat::new());
        mock.push_ok(r#"{"duplicate": true, "matched_id": "t1"}"#);
        let deduper = TaskDeduper::new(mock.clone());

        let verdict = deduper.judge("start a 5 min countdown", &candidates()).await;
        assert!(verdict.duplicate);
        assert_eq!(verdict.matched_id.as_deref(), Some("t1"));

        // The prompt lists every candidate for the judge to compare against.
        let prompt = &mock.requests()[0].system;
        assert!(prompt.contains("t1: set a timer"));
        assert!(prompt.contains("t2: open chrome"));
    }

    #[tokio::test]
    async fn judge_failure_is_not_duplicate() {
        let mock = Arc::new(MockChat::new());
        mock.push_err("model unavailable");
        let deduper = TaskDeduper::new(mock);
        let verdict = deduper.judge("open chrome", &candidates()).await;
        assert!(!verdict.duplicate);
    }

    #[tokio::test]
    async fn unparseable_verdict_is_not_duplicate() {
        let mock = Arc::new(MockChat::new());
        mock.push_ok("I think it might be a duplicate?");
        let deduper = TaskDeduper::new(mock);
        let verdict = deduper.judge("open chrome", &candidates()).await;
        assert!(!verdict.duplicate);
    }
}
