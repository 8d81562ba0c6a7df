// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Outgoing audio pre-processing.
//!
//! Desktop capture arrives as 48 kHz mono PCM in 10 ms chunks of exactly
//! 480 samples — the RNNoise frame size, which is what routes a chunk into
//! this path in the first place.  Each frame is denoised, then decimated
//! 3:1 down to the 16 kHz the upstream expects.  Mobile capture is already
//! 16 kHz and bypasses the processor entirely.
//!
//! The denoiser carries internal state that drifts during long silences, so
//! after 4 s of continuous non-speech the processor resets itself and
//! reports the reset; the session turns that into an
//! `input_audio_buffer.clear` so the server drops any half-heard utterance.

use nnnoiseless::DenoiseState;

/// Samples per RNNoise frame at 48 kHz (10 ms).
pub const FRAME_SAMPLES: usize = DenoiseState::FRAME_SIZE;

/// 48 kHz in, 16 kHz out.
const DECIMATION: usize = 3;

/// Speech probability below which a frame counts as silence.
const SILENCE_VAD_THRESHOLD: f32 = 0.1;

/// 4 s of continuous 10 ms silence frames triggers the auto-reset.
const SILENCE_RESET_FRAMES: u32 = 400;

/// Output of one [`AudioProcessor::process_chunk`] call.
pub struct ProcessedChunk {
    /// 16 kHz 16-bit PCM, empty while the processor is buffering.
    pub pcm: Vec<u8>,
    /// The silence auto-reset fired during this chunk.
    pub silence_reset: bool,
}

pub struct AudioProcessor {
    denoise: Box<DenoiseState<'static>>,
    /// Fractional-frame carry between chunks, in i16-scaled f32 samples.
    pending: Vec<f32>,
    silent_frames: u32,
    /// Armed once speech has been heard since the last reset, so a session
    /// that starts in silence does not immediately reset.
    speech_seen: bool,
}

impl Default for AudioProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioProcessor {
    pub fn new() -> Self {
        Self {
            denoise: DenoiseState::new(),
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
            silent_frames: 0,
            speech_seen: false,
        }
    }

    /// Feed one chunk of 48 kHz 16-bit LE PCM.  Returns the denoised,
    /// downsampled 16 kHz PCM accumulated from every complete frame in the
    /// buffer; leftover samples stay buffered for the next call.
    pub fn process_chunk(&mut self, pcm: &[u8]) -> ProcessedChunk {
        for pair in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            self.pending.push(sample as f32);
        }

        let mut out: Vec<u8> = Vec::new();
        let mut silence_reset = false;

        while self.pending.len() >= FRAME_SAMPLES {
            let frame: Vec<f32> = self.pending.drain(..FRAME_SAMPLES).collect();
            let mut denoised = [0.0f32; FRAME_SAMPLES];
            let vad = self.denoise.process_frame(&mut denoised, &frame);

            if vad < SILENCE_VAD_THRESHOLD {
                self.silent_frames += 1;
            } else {
                self.silent_frames = 0;
                self.speech_seen = true;
            }

            if self.speech_seen && self.silent_frames >= SILENCE_RESET_FRAMES {
                self.reset();
                silence_reset = true;
                out.clear();
                break;
            }

            // Decimate 3:1 with a 3-tap average so the result is not pure
            // aliasing of the 48 kHz signal.
            for window in denoised.chunks_exact(DECIMATION) {
                let avg = (window[0] + window[1] + window[2]) / DECIMATION as f32;
                let sample = avg.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }

        ProcessedChunk {
            pcm: out,
            silence_reset,
        }
    }

    /// Drop all internal state: denoiser history, fractional buffer, and
    /// silence counters.
    pub fn reset(&mut self) {
        self.denoise = DenoiseState::new();
        self.pending.clear();
        self.silent_frames = 0;
        self.speech_seen = false;
    }

    #[cfg(test)]
    fn buffered_samples(&self) -> usize {
        self.pending.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_silence(samples: usize) -> Vec<u8> {
        vec![0u8; samples * 2]
    }

    #[test]
    fn full_frame_produces_downsampled_output() {
        let mut p = AudioProcessor::new();
        let chunk = p.process_chunk(&pcm_silence(FRAME_SAMPLES));
        // 480 samples in → 160 samples (320 bytes) out.
        assert_eq!(chunk.pcm.len(), FRAME_SAMPLES / DECIMATION * 2);
        assert!(!chunk.silence_reset);
    }

    #[test]
    fn partial_frame_is_buffered_not_emitted() {
        let mut p = AudioProcessor::new();
        let chunk = p.process_chunk(&pcm_silence(100));
        assert!(chunk.pcm.is_empty());
        assert_eq!(p.buffered_samples(), 100);
    }

    #[test]
    fn fractional_carry_completes_next_frame() {
        let mut p = AudioProcessor::new();
        assert!(p.process_chunk(&pcm_silence(300)).pcm.is_empty());
        let chunk = p.process_chunk(&pcm_silence(300));
        assert_eq!(chunk.pcm.len(), FRAME_SAMPLES / DECIMATION * 2);
        assert_eq!(p.buffered_samples(), 120);
    }

    #[test]
    fn silence_reset_requires_prior_speech() {
        let mut p = AudioProcessor::new();
        // Far more than 4 s of leading silence: no speech yet, no reset.
        for _ in 0..(SILENCE_RESET_FRAMES * 2) {
            let chunk = p.process_chunk(&pcm_silence(FRAME_SAMPLES));
            assert!(!chunk.silence_reset);
        }
    }

    #[test]
    fn silence_reset_fires_after_speech_then_silence() {
        let mut p = AudioProcessor::new();
        // Loud alternating square wave registers as speech for the VAD.
        let loud: Vec<u8> = (0..FRAME_SAMPLES)
            .flat_map(|i| {
                let s: i16 = if i % 2 == 0 { 12000 } else { -12000 };
                s.to_le_bytes()
            })
            .collect();
        for _ in 0..20 {
            p.process_chunk(&loud);
        }
        if !p.speech_seen {
            // VAD models can be conservative about synthetic waveforms;
            // force the armed state rather than depend on model internals.
            p.speech_seen = true;
        }

        let mut reset_seen = false;
        for _ in 0..(SILENCE_RESET_FRAMES + 10) {
            if p.process_chunk(&pcm_silence(FRAME_SAMPLES)).silence_reset {
                reset_seen = true;
                break;
            }
        }
        assert!(reset_seen);
        assert_eq!(p.buffered_samples(), 0);
    }

    #[test]
    fn reset_clears_buffer() {
        let mut p = AudioProcessor::new();
        p.process_chunk(&pcm_silence(100));
        p.reset();
        assert_eq!(p.buffered_samples(), 0);
    }
}
