//! Exponential backoff with optional jitter.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use rand::Rng;

use super::config::ReconnectionConfig;

// ============================================================================
// Constants
// ============================================================================

/// Lower bound of the jitter factor (inclusive).
const JITTER_MIN: f64 = 0.5;

/// Upper bound of the jitter factor (exclusive).
const JITTER_MAX: f64 = 1.0;

// ============================================================================
// Functions
// ============================================================================

/// Returns `min(initial * multiplier^attempt, max)`.
///
/// Overflow saturates to `max`.
#[must_use]
pub fn calculate_backoff(
    attempt: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = initial.as_secs_f64() * multiplier.powi(exponent);

    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

/// Scales `base` by `factor`, keeping a non-zero result strictly below it.
#[must_use]
pub fn apply_jitter(base: Duration, factor: f64) -> Duration {
    let jittered = base.mul_f64(factor.clamp(0.0, 1.0));
    if !base.is_zero() && jittered >= base {
        return base - Duration::from_nanos(1);
    }
    jittered
}

// ============================================================================
// Backoff
// ============================================================================

/// Delay policy derived from a [`ReconnectionConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    max_attempts: u32,
}

impl Backoff {
    /// Creates the policy for `config`.
    #[must_use]
    pub fn from_config(config: &ReconnectionConfig) -> Self {
        Self {
            initial: config.initial_delay,
            max: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            max_attempts: config.max_attempts,
        }
    }

    /// Returns the delay before `attempt` without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.initial, self.max, self.multiplier)
    }

    /// Returns the delay to wait before `attempt` (zero-based).
    ///
    /// With jitter enabled the result lies in `[0.5 * base, base)`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
        apply_jitter(base, factor)
    }

    /// Returns `true` while `attempts` made so far leave room for another.
    #[inline]
    #[must_use]
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Returns the attempt limit.
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn test_doubling_sequence() {
        let backoff = Backoff::from_config(&ReconnectionConfig::new().without_jitter());
        assert_eq!(backoff.delay(0), secs(1));
        assert_eq!(backoff.delay(1), secs(2));
        assert_eq!(backoff.delay(2), secs(4));
        assert_eq!(backoff.delay(10), secs(60));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        assert_eq!(calculate_backoff(u32::MAX, secs(1), secs(60), 2.0), secs(60));
        assert_eq!(calculate_backoff(5_000, secs(1), secs(60), 10.0), secs(60));
    }

    #[test]
    fn test_unit_multiplier_is_constant() {
        for attempt in 0..5 {
            assert_eq!(calculate_backoff(attempt, secs(3), secs(60), 1.0), secs(3));
        }
    }

    #[test]
    fn test_jitter_edges() {
        assert_eq!(apply_jitter(secs(4), 0.5), secs(2));
        assert!(apply_jitter(secs(4), 1.0) < secs(4));
        assert_eq!(apply_jitter(Duration::ZERO, 0.9), Duration::ZERO);
    }

    #[test]
    fn test_should_retry() {
        let backoff = Backoff::from_config(&ReconnectionConfig::new().with_max_attempts(3));
        assert!(backoff.should_retry(2));
        assert!(!backoff.should_retry(3));
        assert_eq!(backoff.max_attempts(), 3);
    }

    proptest! {
        #[test]
        fn prop_base_delay_is_capped_power(
            attempt in 0u32..64,
            initial_ms in 1u64..5_000,
            extra_ms in 0u64..120_000,
            multiplier in 1.0f64..4.0,
        ) {
            let initial = Duration::from_millis(initial_ms);
            let max = Duration::from_millis(initial_ms + extra_ms);
            let delay = calculate_backoff(attempt, initial, max, multiplier);

            let expected = (initial.as_secs_f64() * multiplier.powi(attempt as i32))
                .min(max.as_secs_f64());
            prop_assert!(delay <= max);
            prop_assert!((delay.as_secs_f64() - expected).abs() < 1e-6);
        }

        #[test]
        fn prop_jittered_delay_in_range(attempt in 0u32..16, initial_ms in 1u64..10_000) {
            let config = ReconnectionConfig::new()
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_max_delay(Duration::from_secs(300));
            let backoff = Backoff::from_config(&config);

            let base = backoff.base_delay(attempt);
            let delay = backoff.delay(attempt);
            prop_assert!(delay < base);
            prop_assert!(delay >= base.mul_f64(0.5) - Duration::from_nanos(1));
        }
    }
}
