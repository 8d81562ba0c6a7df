// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static upstream profile table.
//!
//! Realtime upstreams differ in how they ingest images, whether they tolerate
//! long-idle sessions, and what audio formats they speak.  Rather than
//! branching on model-name substrings all over the session code, every
//! behavioural difference is captured here and looked up once at connect
//! time.  Unknown models resolve to a conservative default: no native image
//! input, no idle timeout.

/// How an upstream accepts image frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageInput {
    /// No native image path; images go through the external vision model.
    None,
    /// A dedicated buffer-append event, e.g. `input_image_buffer.append`.
    Append {
        event: &'static str,
        field: &'static str,
    },
    /// A user conversation item with an `input_image` content part.
    UserItem,
}

#[derive(Debug, Clone, Copy)]
pub struct UpstreamProfile {
    pub key: &'static str,
    pub image_input: ImageInput,
    /// Whether the 90-second silence timeout applies to this upstream.
    pub aggressive_idle: bool,
    pub default_voice: &'static str,
    pub input_audio_format: &'static str,
    pub output_audio_format: &'static str,
}

impl UpstreamProfile {
    pub fn native_image_input(&self) -> bool {
        self.image_input != ImageInput::None
    }
}

const PROFILES: &[UpstreamProfile] = &[
    UpstreamProfile {
        key: "glm",
        image_input: ImageInput::Append {
            event: "input_audio_buffer.append_video_frame",
            field: "video_frame",
        },
        aggressive_idle: true,
        default_voice: "tongtong",
        input_audio_format: "pcm16",
        output_audio_format: "pcm",
    },
    UpstreamProfile {
        key: "qwen",
        image_input: ImageInput::Append {
            event: "input_image_buffer.append",
            field: "image",
        },
        aggressive_idle: false,
        default_voice: "Cherry",
        input_audio_format: "pcm16",
        output_audio_format: "pcm16",
    },
    UpstreamProfile {
        key: "gpt",
        image_input: ImageInput::UserItem,
        aggressive_idle: false,
        default_voice: "marin",
        input_audio_format: "pcm16",
        output_audio_format: "pcm16",
    },
    UpstreamProfile {
        key: "step",
        image_input: ImageInput::None,
        aggressive_idle: false,
        default_voice: "qingchunshaonv",
        input_audio_format: "pcm16",
        output_audio_format: "pcm16",
    },
    UpstreamProfile {
        key: "free",
        image_input: ImageInput::None,
        aggressive_idle: true,
        default_voice: "qingchunshaonv",
        input_audio_format: "pcm16",
        output_audio_format: "pcm16",
    },
];

const DEFAULT_PROFILE: UpstreamProfile = UpstreamProfile {
    key: "default",
    image_input: ImageInput::None,
    aggressive_idle: false,
    default_voice: "",
    input_audio_format: "pcm16",
    output_audio_format: "pcm16",
};

/// Resolve a profile from an explicit key or a model-name substring match.
pub fn lookup_profile(explicit: Option<&str>, model: &str) -> UpstreamProfile {
    if let Some(key) = explicit {
        if let Some(p) = PROFILES.iter().find(|p| p.key == key) {
            return *p;
        }
    }
    PROFILES
        .iter()
        .find(|p| model.contains(p.key))
        .copied()
        .unwrap_or(DEFAULT_PROFILE)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_key_wins_over_model_substring() {
        let p = lookup_profile(Some("step"), "qwen-omni-turbo-realtime");
        assert_eq!(p.key, "step");
    }

    #[test]
    fn model_substring_match() {
        let p = lookup_profile(None, "glm-realtime-4v");
        assert_eq!(p.key, "glm");
        assert!(p.aggressive_idle);
    }

    #[test]
    fn unknown_model_is_conservative() {
        let p = lookup_profile(None, "some-future-model");
        assert_eq!(p.key, "default");
        assert!(!p.native_image_input());
        assert!(!p.aggressive_idle);
    }

    #[test]
    fn qwen_has_native_image_no_idle_timeout() {
        let p = lookup_profile(None, "qwen-omni-turbo-realtime");
        assert!(p.native_image_input());
        assert!(!p.aggressive_idle);
    }

    #[test]
    fn free_profile_has_idle_timeout_without_native_image() {
        let p = lookup_profile(None, "free-model");
        assert!(!p.native_image_input());
        assert!(p.aggressive_idle);
    }
}
