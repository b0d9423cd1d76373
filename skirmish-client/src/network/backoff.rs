//! Reconnect backoff.
//!
//! Delays grow by `factor` per failed attempt up to `max`, with a random
//! spread of `jitter_percent` either way so observers dropped together do not
//! reconnect together.

use std::time::Duration;

use rand::Rng;

/// Backoff tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
    pub jitter_percent: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
            factor: 2,
            jitter_percent: 20,
        }
    }
}

/// Exponential backoff state for one channel.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay before retry number `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = self.config.max.as_millis() as u64;
        let mut delay = self.config.initial.as_millis() as u64;
        for _ in 0..attempt {
            if delay >= max {
                break;
            }
            delay = delay.saturating_mul(u64::from(self.config.factor.max(1)));
        }
        Duration::from_millis(delay.min(max))
    }

    /// Delay before the next retry; counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt).as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);

        let spread = base * u64::from(self.config.jitter_percent.min(100)) / 100;
        let jittered = if spread == 0 {
            base
        } else {
            base - spread + rand::thread_rng().gen_range(0..=spread * 2)
        };
        Duration::from_millis(jittered.min(self.config.max.as_millis() as u64))
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
