//! Exponential backoff for failed sync passes

use std::time::Duration;

/// Tracks consecutive failures and the resulting delay
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: 0 }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// `base * 2^failures`, capped at the maximum
    pub fn delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Wait before the next pass: the regular interval, or the backoff delay after failures
    pub fn next_delay(&self, interval: Duration) -> Duration {
        if self.failures > 0 {
            self.delay()
        } else {
            interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(600));
        assert_eq!(backoff.next_delay(Duration::from_secs(300)).as_secs(), 300);

        backoff.record_failure();
        assert_eq!(backoff.delay().as_secs(), 60);
        backoff.record_failure();
        assert_eq!(backoff.delay().as_secs(), 120);
        for _ in 0..40 {
            backoff.record_failure();
        }
        assert_eq!(backoff.delay().as_secs(), 600); // capped

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(Duration::from_secs(300)).as_secs(), 300);
    }
}
