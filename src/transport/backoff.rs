//! Reconnect backoff
//!
//! `delay = clamp(base * multiplier^(failures - 1) * jitter, min, max)` with
//! jitter drawn uniformly from the configured range. The failure counter
//! resets on connect and stops growing once the raw delay reaches `max`.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure, before jitter
    pub base: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Lower bound
    pub min: Duration,
    /// Upper bound
    pub max: Duration,
    /// Jitter factor range, inclusive
    pub jitter: (f64, f64),
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            min: Duration::from_secs(1),
            max: Duration::from_secs(120),
            jitter: (0.8, 1.2),
        }
    }
}

/// Consecutive-failure tracker for one connection
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    failures: u32,
    saturated: bool,
}

impl ReconnectBackoff {
    #[must_use]
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            saturated: false,
        }
    }

    /// Consecutive failures counted so far
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the raw delay has reached `max`
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        self.saturated
    }

    /// Record a failure and return the delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let (lo, hi) = self.policy.jitter;
        let jitter = if lo < hi {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            lo
        };
        self.next_delay_with_jitter(jitter)
    }

    /// Record a failure using a fixed jitter factor
    pub fn next_delay_with_jitter(&mut self, jitter: f64) -> Duration {
        if !self.saturated {
            self.failures = self.failures.saturating_add(1);
        }

        let exponent = i32::try_from(self.failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let max = self.policy.max.as_secs_f64();
        let mut raw = self.policy.base.as_secs_f64() * self.policy.multiplier.powi(exponent);
        if !raw.is_finite() {
            raw = max;
        }
        if raw >= max {
            self.saturated = true;
        }

        let secs = (raw * jitter).clamp(self.policy.min.as_secs_f64(), max);
        Duration::from_secs_f64(secs)
    }

    /// Forget past failures after a successful connect
    pub const fn reset(&mut self) {
        self.failures = 0;
        self.saturated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(d: Duration) -> f64 {
        d.as_secs_f64()
    }

    #[test]
    fn grows_exponentially_without_jitter() {
        let mut backoff = ReconnectBackoff::new(BackoffPolicy::default());

        let delays: Vec<f64> = (0..5).map(|_| secs(backoff.next_delay_with_jitter(1.0))).collect();
        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0, 16.0]);
    }

    #[test]
    fn saturates_at_max_and_stops_counting() {
        let mut backoff = ReconnectBackoff::new(BackoffPolicy::default());

        for _ in 0..20 {
            backoff.next_delay_with_jitter(1.0);
        }
        // 2^7 = 128 >= 120 on the 8th failure
        assert_eq!(backoff.failures(), 8);
        assert!(backoff.is_saturated());
        assert_eq!(backoff.next_delay_with_jitter(1.0), Duration::from_secs(120));
        assert_eq!(backoff.failures(), 8);
    }

    #[test]
    fn jittered_delays_stay_within_bounds() {
        let policy = BackoffPolicy::default();
        let mut backoff = ReconnectBackoff::new(policy);

        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= policy.min);
            assert!(delay <= policy.max);
        }
    }

    #[test]
    fn non_decreasing_at_fixed_jitter() {
        for jitter in [0.8, 1.0, 1.2] {
            let mut backoff = ReconnectBackoff::new(BackoffPolicy::default());
            let mut last = Duration::ZERO;
            for _ in 0..15 {
                let delay = backoff.next_delay_with_jitter(jitter);
                assert!(delay >= last);
                last = delay;
            }
            // saturates on the 8th failure, raw 2^7 = 128
            assert_eq!(last, Duration::from_secs_f64((128.0 * jitter).min(120.0)));
        }
    }

    #[test]
    fn low_jitter_is_clamped_to_min() {
        let mut backoff = ReconnectBackoff::new(BackoffPolicy::default());
        assert_eq!(backoff.next_delay_with_jitter(0.8), Duration::from_secs(1));
    }

    #[test]
    fn zero_base_never_produces_an_invalid_delay() {
        let policy = BackoffPolicy {
            base: Duration::ZERO,
            ..BackoffPolicy::default()
        };
        let mut backoff = ReconnectBackoff::new(policy);

        for _ in 0..2000 {
            let delay = backoff.next_delay_with_jitter(1.0);
            assert!(delay >= policy.min);
            assert!(delay <= policy.max);
        }
        assert!(backoff.is_saturated());
    }

    #[test]
    fn reset_restarts_from_first_delay() {
        let mut backoff = ReconnectBackoff::new(BackoffPolicy::default());
        let first = backoff.next_delay_with_jitter(1.0);
        for _ in 0..10 {
            backoff.next_delay_with_jitter(1.0);
        }

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(!backoff.is_saturated());
        assert_eq!(backoff.next_delay_with_jitter(1.0), first);
    }
}
