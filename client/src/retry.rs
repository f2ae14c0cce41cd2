use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use serde::Deserialize;

const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 5;
const DEFAULT_MIN_DELAY_MS: u64 = 200;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_FACTOR: f32 = 2.0;

/// How the round loop backs off between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive transport failures tolerated before giving up.
    pub max_consecutive_failures: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            factor: DEFAULT_FACTOR,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Checks the bounds once at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_consecutive_failures == 0 {
            return Err("retry.max_consecutive_failures must be at least 1".into());
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(format!(
                "retry.min_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            ));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(format!("retry.factor must be at least 1, got {}", self.factor));
        }
        Ok(())
    }

    /// A fresh delay schedule: `min_delay`, then multiplied by `factor` up to
    /// `max_delay`.
    pub fn backoff(&self) -> Backoff {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay())
            .with_max_delay(self.max_delay())
            .with_factor(self.factor)
            .with_max_times(self.max_consecutive_failures);

        if self.jitter {
            builder = builder.with_jitter();
        }

        Backoff {
            inner: builder.build(),
            ceiling: self.max_delay(),
        }
    }
}

/// The delays of one run of consecutive failures.
#[derive(Debug)]
pub struct Backoff {
    inner: ExponentialBackoff,
    ceiling: Duration,
}

impl Backoff {
    /// The delay before the next attempt. Past the end of the schedule the
    /// ceiling is used.
    pub fn next_delay(&mut self) -> Duration {
        self.inner.next().unwrap_or(self.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_ceiling() {
        let policy = RetryPolicy {
            max_consecutive_failures: 6,
            min_delay_ms: 100,
            max_delay_ms: 500,
            factor: 2.0,
            jitter: false,
        };

        let mut backoff = policy.backoff();
        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500, 500, 500]);
    }

    #[test]
    fn a_fresh_schedule_starts_over() {
        let policy = RetryPolicy::default();

        let mut backoff = policy.backoff();
        backoff.next_delay();
        backoff.next_delay();

        assert_eq!(policy.backoff().next_delay(), policy.min_delay());
    }

    #[test]
    fn bad_bounds_are_rejected() {
        assert!(RetryPolicy::default().validate().is_ok());

        let zero = RetryPolicy {
            max_consecutive_failures: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.validate().is_err());

        let inverted = RetryPolicy {
            min_delay_ms: 20_000,
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }
}
