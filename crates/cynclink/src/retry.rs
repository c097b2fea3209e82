//! Jittered exponential backoff between retry attempts.

use crate::options::TransportOptions;
use std::time::Duration;

/// Backoff schedule: `min(cap, base · 2^(attempt−1)) · U(1−j, 1+j)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    jitter: f64,
    pub max_retries: u16,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: f64, max_retries: u16) -> Self {
        Self {
            base,
            cap,
            jitter,
            max_retries,
        }
    }

    pub fn from_options(opts: &TransportOptions) -> Self {
        Self::new(
            opts.backoff_base(),
            opts.backoff_cap(),
            opts.backoff_jitter_fraction,
            opts.max_retries,
        )
    }

    /// Delay before retry `attempt` (1-based). Jitter comes from the thread
    /// PRNG; this schedule needs spread, not unpredictability.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let raw_ms = self.base.as_secs_f64() * 1_000.0 * 2f64.powi(exp as i32);
        let capped_ms = raw_ms.min(self.cap.as_secs_f64() * 1_000.0);
        let factor = 1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64(capped_ms * factor / 1_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_within_jitter_bounds() {
        let policy = RetryPolicy::new(Duration::from_millis(128), Duration::from_secs(2), 0.1, 3);
        for attempt in 1..=4u32 {
            let ideal_ms = (128.0 * 2f64.powi(attempt as i32 - 1)).min(2_000.0);
            for _ in 0..200 {
                let d = policy.delay(attempt).as_secs_f64() * 1_000.0;
                assert!(
                    d >= ideal_ms * 0.9 - 1e-6 && d <= ideal_ms * 1.1 + 1e-6,
                    "attempt {attempt}: {d} ms outside [{}, {}]",
                    ideal_ms * 0.9,
                    ideal_ms * 1.1
                );
            }
        }
    }

    #[test]
    fn test_delay_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(2), 0.0, 3);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        // Past the cap the delay stays flat, even for absurd attempt counts.
        assert_eq!(policy.delay(10), Duration::from_secs(2));
        assert_eq!(policy.delay(1_000), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(2), 0.0, 3);
        assert_eq!(policy.delay(2), policy.delay(2));
    }
}
