// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Repetition detection over completed response transcripts.
//!
//! Realtime models occasionally lock into near-identical answers turn after
//! turn.  After each `response.done` the finished transcript is compared to
//! the previous two; when both comparisons clear the similarity threshold
//! the detector trips, empties its ring buffer, and leaves the reaction to
//! the owning layer.

use similar::TextDiff;

const DEFAULT_THRESHOLD: f64 = 0.8;
const DEFAULT_CAPACITY: usize = 3;

pub struct RepetitionDetector {
    recent: Vec<String>,
    threshold: f64,
    capacity: usize,
}

impl Default for RepetitionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_CAPACITY)
    }
}

/// Character-level diff ratio in `[0, 1]`.
fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    TextDiff::from_chars(a, b).ratio() as f64
}

impl RepetitionDetector {
    pub fn new(threshold: f64, capacity: usize) -> Self {
        Self {
            recent: Vec::with_capacity(capacity),
            threshold,
            capacity,
        }
    }

    /// Record a completed transcript.  Returns `true` when it is the third
    /// consecutive near-duplicate; the buffer is cleared on trigger.
    pub fn observe(&mut self, transcript: &str) -> bool {
        let high_similarity = self
            .recent
            .iter()
            .filter(|r| similarity(transcript, r) >= self.threshold)
            .count();

        self.recent.push(transcript.to_string());
        if self.recent.len() > self.capacity {
            self.recent.remove(0);
        }

        if high_similarity >= 2 {
            self.recent.clear();
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.recent.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_similarity_one() {
        assert_eq!(similarity("hello world", "hello world"), 1.0);
    }

    #[test]
    fn disjoint_strings_have_low_similarity() {
        assert!(similarity("aaaaaaaa", "zzzzzzzz") < 0.2);
    }

    #[test]
    fn two_repeats_do_not_trigger() {
        let mut d = RepetitionDetector::default();
        assert!(!d.observe("I already told you the answer."));
        assert!(!d.observe("I already told you the answer."));
    }

    #[test]
    fn third_repeat_triggers_and_clears() {
        let mut d = RepetitionDetector::default();
        assert!(!d.observe("I already told you the answer."));
        assert!(!d.observe("I already told you the answer!"));
        assert!(d.observe("I already told you the answer."));
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn varied_responses_never_trigger() {
        let mut d = RepetitionDetector::default();
        assert!(!d.observe("The weather is sunny today."));
        assert!(!d.observe("Your timer is set for five minutes."));
        assert!(!d.observe("I found three results for that search."));
        assert!(!d.observe("Good night, talk tomorrow."));
    }

    #[test]
    fn buffer_is_bounded() {
        let mut d = RepetitionDetector::default();
        for i in 0..10 {
            d.observe(&format!("completely unrelated response number {i} xyz{i}"));
        }
        assert!(d.len() <= 3);
    }

    #[test]
    fn after_trigger_detection_restarts_from_scratch() {
        let mut d = RepetitionDetector::default();
        d.observe("same thing");
        d.observe("same thing");
        assert!(d.observe("same thing"));
        // Buffer cleared: two more repeats are needed before the next trip.
        assert!(!d.observe("same thing"));
        assert!(!d.observe("same thing"));
        assert!(d.observe("same thing"));
    }
}
