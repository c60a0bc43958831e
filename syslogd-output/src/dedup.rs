//! Duplicate suppression for text destinations.
//!
//! The body of each formatted line (everything after the time prefix) is
//! hashed. A body identical to the last written one, arriving within the
//! window of that write, is suppressed and counted. The count is flushed as
//! a "last message repeated" line before the next different write, or when
//! the window runs out.

use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a formatted body.
pub fn body_hash(body: &str) -> String {
    let mut h = Sha256::new();
    h.update(body.as_bytes());
    hex::encode(h.finalize())
}

/// What to do with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupDecision {
    /// Write it, after flushing `flush` pending repeats if any.
    Write { flush: Option<u32> },
    /// Drop it; the pending count must be flushed by `deadline`.
    Suppress { deadline: Instant },
}

#[derive(Debug, Default)]
pub struct DupState {
    last_hash: Option<String>,
    last_body: String,
    last_write: Option<Instant>,
    count: u32,
    deadline: Option<Instant>,
}

impl DupState {
    /// Decide whether `body` is a repeat. A `Write` changes nothing until
    /// [`DupState::written`] confirms the line landed.
    pub fn check(&mut self, body: &str, now: Instant, window: Duration) -> DupDecision {
        let hash = body_hash(body);
        let within = self
            .last_write
            .is_some_and(|t| now.saturating_duration_since(t) < window);
        if !window.is_zero()
            && within
            && self.last_hash.as_deref() == Some(hash.as_str())
            && self.last_body == body
        {
            self.count += 1;
            let deadline = self
                .last_write
                .map(|t| t + window)
                .unwrap_or(now + window);
            self.deadline = Some(deadline);
            return DupDecision::Suppress { deadline };
        }

        DupDecision::Write {
            flush: (self.count > 0).then_some(self.count),
        }
    }

    /// Remember `body` as the last line that actually reached the file.
    /// Any pending count must already have been flushed.
    pub fn written(&mut self, body: &str, now: Instant) {
        self.deadline = None;
        self.count = 0;
        self.last_hash = Some(body_hash(body));
        self.last_body = body.to_string();
        self.last_write = Some(now);
    }

    /// Pending repeats whose timer has fired by `now`.
    pub fn take_due(&mut self, now: Instant) -> Option<u32> {
        match self.deadline {
            Some(d) if d <= now => self.take_pending(),
            _ => None,
        }
    }

    /// Pending repeats regardless of the timer (before close).
    pub fn take_pending(&mut self) -> Option<u32> {
        self.deadline = None;
        let count = std::mem::take(&mut self.count);
        (count > 0).then_some(count)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn pending(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(30);

    #[test]
    fn identical_body_within_window_is_suppressed() {
        let t0 = Instant::now();
        let mut dup = DupState::default();
        assert_eq!(dup.check("a", t0, WINDOW), DupDecision::Write { flush: None });
        dup.written("a", t0);
        let second = dup.check("a", t0 + Duration::from_millis(100), WINDOW);
        assert_eq!(second, DupDecision::Suppress { deadline: t0 + WINDOW });
        assert_eq!(dup.pending(), 1);
        let third = dup.check("b", t0 + Duration::from_millis(200), WINDOW);
        assert_eq!(third, DupDecision::Write { flush: Some(1) });
        dup.written("b", t0 + Duration::from_millis(200));
        assert_eq!(dup.pending(), 0);
    }

    #[test]
    fn identical_body_after_window_is_written() {
        let t0 = Instant::now();
        let mut dup = DupState::default();
        dup.written("a", t0);
        let later = dup.check("a", t0 + WINDOW, WINDOW);
        assert_eq!(later, DupDecision::Write { flush: None });
    }

    #[test]
    fn timer_flush_clears_the_count() {
        let t0 = Instant::now();
        let mut dup = DupState::default();
        dup.written("a", t0);
        dup.check("a", t0 + Duration::from_secs(1), WINDOW);
        dup.check("a", t0 + Duration::from_secs(2), WINDOW);
        assert_eq!(dup.take_due(t0 + Duration::from_secs(10)), None);
        assert_eq!(dup.take_due(t0 + WINDOW), Some(2));
        assert_eq!(dup.deadline(), None);
    }

    #[test]
    fn zero_window_disables_suppression() {
        let t0 = Instant::now();
        let mut dup = DupState::default();
        dup.written("a", t0);
        assert_eq!(dup.check("a", t0, Duration::ZERO), DupDecision::Write { flush: None });
    }

    #[test]
    fn unconfirmed_write_is_not_a_reference_for_repeats() {
        let t0 = Instant::now();
        let mut dup = DupState::default();
        assert_eq!(dup.check("a", t0, WINDOW), DupDecision::Write { flush: None });
        // The append failed, so "a" never reached the file.
        let again = dup.check("a", t0 + Duration::from_secs(1), WINDOW);
        assert_eq!(again, DupDecision::Write { flush: None });
        assert_eq!(dup.pending(), 0);
    }

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(body_hash("").len(), 64);
        assert_ne!(body_hash("a"), body_hash("b"));
    }
}
