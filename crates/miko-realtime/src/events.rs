// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Upstream event decoding.
//!
//! The realtime wire protocol has grown two generations of delta event
//! names (`response.text.delta` vs `response.output_text.delta`); both fold
//! into the same variant here.  Kinds outside the whitelist decode to
//! [`UpstreamEvent::Unknown`] so the read loop can log them instead of
//! silently swallowing new protocol additions.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    SessionCreated,
    ResponseCreated { response_id: Option<String> },
    OutputItemAdded { item_id: Option<String> },
    TextDelta { delta: String },
    AudioDelta { delta_b64: String },
    AudioTranscriptDelta { delta: String },
    AudioTranscriptDone { transcript: String },
    ResponseDone,
    SpeechStarted,
    SpeechStopped,
    InputTranscriptCompleted { transcript: String },
    Error { message: String },
    Unknown { kind: String },
}

fn str_field(event: &Value, key: &str) -> String {
    event[key].as_str().unwrap_or("").to_string()
}

/// Decode one JSON text frame from the upstream.
pub fn parse_event(text: &str) -> Result<UpstreamEvent, serde_json::Error> {
    let event: Value = serde_json::from_str(text)?;
    let kind = event["type"].as_str().unwrap_or("");

    Ok(match kind {
        "session.created" | "session.updated" => UpstreamEvent::SessionCreated,
        "response.created" => UpstreamEvent::ResponseCreated {
            response_id: event["response"]["id"].as_str().map(String::from),
        },
        "response.output_item.added" => UpstreamEvent::OutputItemAdded {
            item_id: event["item"]["id"].as_str().map(String::from),
        },
        "response.text.delta" | "response.output_text.delta" => UpstreamEvent::TextDelta {
            delta: str_field(&event, "delta"),
        },
        "response.audio.delta" | "response.output_audio.delta" => UpstreamEvent::AudioDelta {
            delta_b64: str_field(&event, "delta"),
        },
        "response.audio_transcript.delta" | "response.output_audio_transcript.delta" => {
            UpstreamEvent::AudioTranscriptDelta {
                delta: str_field(&event, "delta"),
            }
        }
        "response.audio_transcript.done" | "response.output_audio_transcript.done" => {
            UpstreamEvent::AudioTranscriptDone {
                transcript: str_field(&event, "transcript"),
            }
        }
        "response.done" => UpstreamEvent::ResponseDone,
        "input_audio_buffer.speech_started" => UpstreamEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => UpstreamEvent::SpeechStopped,
        "conversation.item.input_audio_transcription.completed" => {
            UpstreamEvent::InputTranscriptCompleted {
                transcript: str_field(&event, "transcript"),
            }
        }
        "error" => UpstreamEvent::Error {
            message: event["error"].to_string(),
        },
        other => UpstreamEvent::Unknown {
            kind: other.to_string(),
        },
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_and_output_text_delta_fold_together() {
        let a = parse_event(r#"{"type":"response.text.delta","delta":"hi"}"#).unwrap();
        let b = parse_event(r#"{"type":"response.output_text.delta","delta":"hi"}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, UpstreamEvent::TextDelta { delta: "hi".into() });
    }

    #[test]
    fn audio_delta_carries_base64() {
        let e = parse_event(r#"{"type":"response.output_audio.delta","delta":"QUJD"}"#).unwrap();
        assert_eq!(
            e,
            UpstreamEvent::AudioDelta {
                delta_b64: "QUJD".into()
            }
        );
    }

    #[test]
    fn response_created_extracts_id() {
        let e = parse_event(r#"{"type":"response.created","response":{"id":"resp_1"}}"#).unwrap();
        assert_eq!(
            e,
            UpstreamEvent::ResponseCreated {
                response_id: Some("resp_1".into())
            }
        );
    }

    #[test]
    fn input_transcript_completed() {
        let e = parse_event(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hello"}"#,
        )
        .unwrap();
        assert_eq!(
            e,
            UpstreamEvent::InputTranscriptCompleted {
                transcript: "hello".into()
            }
        );
    }

    #[test]
    fn error_event_stringifies_body() {
        let e = parse_event(r#"{"type":"error","error":{"code":503,"message":"overloaded"}}"#)
            .unwrap();
        match e {
            UpstreamEvent::Error { message } => assert!(message.contains("overloaded")),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_preserved_not_dropped() {
        let e = parse_event(r#"{"type":"rate_limits.updated","limits":[]}"#).unwrap();
        assert_eq!(
            e,
            UpstreamEvent::Unknown {
                kind: "rate_limits.updated".into()
            }
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_event("{nope").is_err());
    }
}
