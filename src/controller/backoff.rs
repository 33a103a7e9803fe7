//! # Backoff
//!
//! Exponential backoff for failed reconciliation passes.

use std::time::Duration;

/// `base * 2^(attempt - 1)`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(500), Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_zero_uses_base() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(250), Duration::from_secs(5));
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
    }
}
