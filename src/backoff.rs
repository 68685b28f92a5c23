//! Jittered exponential backoff for resubscription.

use std::time::Duration;

use rand::Rng;

/// Backoff settings used between resubscription attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Fraction of the delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    /// A fixed delay without growth or jitter.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

/// Backoff state for one resolver.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        let current = config.initial;
        Self { config, current }
    }

    /// Returns the next delay and grows the base delay.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let max = self.config.max;
        let base = self.current.min(max);

        // Clamp before converting back; NaN falls back to max.
        let grown = base.as_secs_f64() * self.config.multiplier.max(1.0);
        self.current = if grown >= max.as_secs_f64() {
            max
        } else {
            Duration::try_from_secs_f64(grown).unwrap_or(max)
        };

        let jitter = if self.config.jitter.is_finite() {
            self.config.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };

        if jitter <= 0.0 {
            return base;
        }

        // Spread the delay over [base * (1 - jitter), base].
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        base.mul_f64(factor)
    }

    /// Resets the delay after a successful subscription.
    pub(crate) fn reset(&mut self) {
        self.current = self.config.initial;
    }
}
