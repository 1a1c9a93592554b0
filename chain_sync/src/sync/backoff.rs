use std::time::Duration;

use rand::Rng;

/// Capped exponential retry delay: `base * 2^(attempt - 1)`, at most `cap`,
/// with up to 10% subtracted as jitter so retries of neighbouring batches
/// do not line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Upper bound of the delay before retry number `attempt` (1-based).
    pub fn max_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow((attempt - 1).min(16));
        self.base.saturating_mul(multiplier).min(self.cap)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay(attempt);
        let jitter_ms = (max.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return max;
        }
        max - Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.max_delay(0), Duration::ZERO);
        assert_eq!(backoff.max_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.max_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.max_delay(4), Duration::from_millis(800));
        assert_eq!(backoff.max_delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.max_delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        for attempt in 1..8 {
            let max = backoff.max_delay(attempt);
            let delay = backoff.delay(attempt);
            assert!(delay <= max);
            assert!(delay >= max - max / 10);
        }
    }
}
