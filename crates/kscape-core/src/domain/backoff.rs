//! Exponential reconnect delay.
//!
//! The delay starts at `initial`, doubles after every failed attempt and never
//! exceeds `max`.  A successful connection calls [`Backoff::reset`] so the
//! next outage starts from `initial` again.

use std::time::Duration;

/// Default first retry delay.
pub const DEFAULT_INITIAL: Duration = Duration::from_secs(1);

/// Default ceiling for the retry delay.
pub const DEFAULT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// Creates a policy.  `max` is raised to `initial` if it is smaller.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Returns the delay to wait before the next attempt and advances the policy.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL, DEFAULT_MAX)
    }
}
