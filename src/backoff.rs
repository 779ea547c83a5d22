//! Reconnect backoff for outbound connections.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

const fn default_jitter() -> f64 {
    0.1
}

const fn default_reset_after() -> Duration {
    Duration::from_secs(5)
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Upward jitter as a fraction of the nominal delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// A connection that lasted at least this long resets the attempt count.
    #[serde(default = "default_reset_after", with = "humantime_serde")]
    pub reset_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            reset_after: default_reset_after(),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("backoff jitter {} is outside 0..=1", self.jitter));
        }
        if self.initial_delay > self.max_delay {
            return Err(format!(
                "backoff initial_delay {:?} exceeds max_delay {:?}",
                self.initial_delay, self.max_delay
            ));
        }
        Ok(())
    }

    /// Delay before attempt `attempt` (1-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * 2f64.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Tracks reconnect attempts for one remote.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: BackoffConfig,
    attempts: u32,
    last_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            last_delay: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A connection closed (or never opened) after being up for `uptime`.
    /// Returns how long to wait before the next attempt.
    pub fn next_delay(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.config.reset_after {
            self.reset();
        }
        self.attempts = self.attempts.saturating_add(1);

        let nominal = self.config.nominal_delay(self.attempts);
        let jitter = self.config.jitter;
        let factor = if jitter.is_finite() && jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(0.0..=jitter.min(1.0))
        } else {
            1.0
        };
        let delay = Duration::try_from_secs_f64(nominal.as_secs_f64() * factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);

        // Jitter must not make the sequence go backwards.
        let delay = delay.max(self.last_delay);
        self.last_delay = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_delay = Duration::ZERO;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
