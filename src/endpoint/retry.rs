//! Exponential backoff with jitter for endpoint retries.

use rand::Rng;
use std::time::Duration;

/// Retry budget and backoff shape for one tile's endpoint calls.
///
/// Retries are bounded per tile, never per job: a tile that exhausts its
/// attempts is dropped with an error record and the region continues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per retry.
    pub factor: f64,
    /// Fractional jitter applied to each delay (0.25 = plus or minus 25%).
    pub jitter: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            factor: 2.0,
            jitter: 0.25,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.factor.powi(retry as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_delay_doubles() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_caps() {
        let policy = no_jitter();
        // 200ms * 2^10 would be ~205s without the cap
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for retry in 0..6 {
            let nominal = no_jitter().backoff_delay(retry).as_secs_f64();
            for _ in 0..50 {
                let delay = policy.backoff_delay(retry).as_secs_f64();
                assert!(delay >= nominal * 0.75 - 1e-9);
                assert!(delay <= nominal * 1.25 + 1e-9);
            }
        }
    }
}
