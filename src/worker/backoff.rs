//! Capped exponential backoff.
//!
//! Used by the retry sender and the delayed task runner to space out repeat
//! attempts. The delay for attempt `n` (0-indexed) is `base * 2^n`, capped at
//! `max`.

use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound for any single delay.
    pub max: Duration,
}

impl Backoff {
    /// Creates a backoff policy.
    pub const fn new(base: Duration, max: Duration) -> Self {
        Backoff { base, max }
    }

    /// Computes the delay for the given attempt (0-indexed).
    ///
    /// Integer arithmetic keeps whole-second bases exact; overflow saturates
    /// at `max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Returns the delays for the first `attempts` retries.
    pub fn delays(&self, attempts: u32) -> impl Iterator<Item = Duration> + '_ {
        (0..attempts).map(|attempt| self.delay_for_attempt(attempt))
    }
}
