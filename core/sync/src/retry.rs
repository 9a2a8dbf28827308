//! Backoff policies for requeued sync tasks.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pause applied after a failed attempt before the drain loop continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay after every failure.
    Flat { delay_ms: u64 },
    /// Delay grows by `multiplier` per retry, capped at `max_delay_ms`.
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        /// Add random jitter of +/- 25%.
        jitter: bool,
    },
}

impl BackoffPolicy {
    /// Flat policy.
    pub fn flat(delay: Duration) -> Self {
        BackoffPolicy::Flat {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Exponential policy with doubling, jitter enabled.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        BackoffPolicy::Exponential {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Enable or disable jitter (exponential only).
    pub fn with_jitter(self, enabled: bool) -> Self {
        match self {
            BackoffPolicy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
                ..
            } => BackoffPolicy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
                jitter: enabled,
            },
            flat => flat,
        }
    }

    /// Delay to wait after the `retry`-th failure (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match *self {
            BackoffPolicy::Flat { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
                jitter,
            } => {
                let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
                let base = initial_delay_ms as f64 * multiplier.powi(exponent);
                let capped = base.min(max_delay_ms as f64);

                let delay = if jitter {
                    let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
                    capped * jitter_factor
                } else {
                    capped
                };
                Duration::from_millis(delay as u64)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Flat { delay_ms: 5_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_delay_is_constant() {
        let policy = BackoffPolicy::flat(Duration::from_millis(250));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_retry(7), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_delay_calculation() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60))
            .with_jitter(false);

        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = BackoffPolicy::Exponential {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 10.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_retry(6), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(4), Duration::from_secs(60));
        for _ in 0..50 {
            let d = policy.delay_for_retry(1).as_millis();
            assert!((3_000..=5_000).contains(&d), "{} out of band", d);
        }
    }

    #[test]
    fn test_policy_serde_shape() {
        let json = serde_json::to_value(BackoffPolicy::default()).unwrap();
        assert_eq!(json["strategy"], "flat");
        assert_eq!(json["delay_ms"], 5_000);
    }
}
