//! Fixed-window counter record.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::{delta, WindowCount};

/// A counter that accumulates hits until its window expires.
///
/// Used both for rate limit windows (the window starts on the first hit and
/// keeps its reset time) and for concurrency counters (the expiry is pushed
/// forward on every increment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindowCounter {
    /// Hits observed in the current window
    count: u64,
    /// When the current window expires
    reset_at: DateTime<Utc>,
}

impl RateWindowCounter {
    /// Create an empty counter whose window ends `window` after `now`.
    pub fn new(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + delta(window),
        }
    }

    /// Record one hit, starting a fresh window if the current one has elapsed.
    pub fn hit(&mut self, now: DateTime<Utc>, window: Duration) -> WindowCount {
        if self.is_expired(now) {
            *self = Self::new(now, window);
        }
        self.count = self.count.saturating_add(1);

        WindowCount {
            count: self.count,
            reset_at: self.reset_at,
        }
    }

    /// Increment and push the expiry to `ttl` from now.
    pub fn increment(&mut self, now: DateTime<Utc>, ttl: Duration) -> u64 {
        if self.is_expired(now) {
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.reset_at = now + delta(ttl);
        self.count
    }

    /// Decrement, clamping at zero. An expired counter reads as zero.
    pub fn decrement(&mut self, now: DateTime<Utc>) -> u64 {
        if self.is_expired(now) {
            self.count = 0;
        }
        self.count = self.count.saturating_sub(1);
        self.count
    }

    /// Current count, zero once the window has elapsed.
    pub fn current(&self, now: DateTime<Utc>) -> u64 {
        if self.is_expired(now) {
            0
        } else {
            self.count
        }
    }

    /// Get the reset time of the current window.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// Whether the window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_first_hit_opens_window() {
        let now = Utc::now();
        let mut counter = RateWindowCounter::new(now, MINUTE);

        let window = counter.hit(now, MINUTE);
        assert_eq!(window.count, 1);
        assert_eq!(window.reset_at, now + chrono::Duration::seconds(60));
        assert!(window.reset_at > now);
    }

    #[test]
    fn test_hits_keep_reset_time() {
        let now = Utc::now();
        let mut counter = RateWindowCounter::new(now, MINUTE);

        let first = counter.hit(now, MINUTE);
        let later = counter.hit(now + chrono::Duration::seconds(30), MINUTE);

        assert_eq!(later.count, 2);
        assert_eq!(first.reset_at, later.reset_at);
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let now = Utc::now();
        let mut counter = RateWindowCounter::new(now, MINUTE);
        for _ in 0..5 {
            counter.hit(now, MINUTE);
        }

        let after = now + chrono::Duration::seconds(61);
        let window = counter.hit(after, MINUTE);
        assert_eq!(window.count, 1);
        assert_eq!(window.reset_at, after + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_decrement_clamps_at_zero() {
        let now = Utc::now();
        let mut counter = RateWindowCounter::new(now, MINUTE);

        assert_eq!(counter.decrement(now), 0);
        assert_eq!(counter.increment(now, MINUTE), 1);
        assert_eq!(counter.decrement(now), 0);
        assert_eq!(counter.decrement(now), 0);
    }

    #[test]
    fn test_increment_refreshes_expiry() {
        let now = Utc::now();
        let mut counter = RateWindowCounter::new(now, MINUTE);
        counter.increment(now, MINUTE);

        let later = now + chrono::Duration::seconds(45);
        counter.increment(later, MINUTE);
        assert_eq!(counter.reset_at(), later + chrono::Duration::seconds(60));
        assert_eq!(counter.current(now + chrono::Duration::seconds(90)), 2);
    }

    #[test]
    fn test_expired_counter_reads_zero() {
        let now = Utc::now();
        let mut counter = RateWindowCounter::new(now, MINUTE);
        counter.increment(now, MINUTE);

        assert_eq!(counter.current(now + chrono::Duration::seconds(60)), 0);
    }
}
