//! Exponential reconnect backoff with jitter and a cap.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Tracks reconnect attempts and produces the delay before each one.
///
/// Delays never decrease between consecutive attempts and never exceed
/// `max_delay`. Once `max_retries` delays have been handed out,
/// [`Backoff::next_delay`] returns `None`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    /// Create a backoff from `config`, clamping the multiplier to at least
    /// 1.0 and the jitter to `0.0..=1.0`.
    #[must_use]
    pub fn new(mut config: ReconnectConfig) -> Self {
        if !config.multiplier.is_finite() || config.multiplier < 1.0 {
            config.multiplier = 1.0;
        }
        config.jitter = if config.jitter.is_finite() {
            config.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if config.max_delay < config.base_delay {
            config.max_delay = config.base_delay;
        }
        Self {
            config,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, or `None` when retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }

        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let raw = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let jittered = raw + raw * self.config.jitter * rand::random::<f64>();
        let cap = self.config.max_delay;
        let delay = Duration::try_from_secs_f64(jittered)
            .map_or(cap, |d| d.min(cap))
            .max(self.last);

        self.attempt += 1;
        self.last = delay;
        Some(delay)
    }

    /// Forget previous attempts after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}
