//! Restart backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff between transfer restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first restart.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier for each subsequent attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    15_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before restart `attempt` (1-based), with ±25% jitter and a
    /// 50 ms floor.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let initial = Duration::from_millis(self.initial_delay_ms).as_secs_f64();
        let max = Duration::from_millis(self.max_delay_ms).as_secs_f64();
        let capped = (initial * self.backoff_factor.powi(exp)).min(max);

        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((capped + capped * 0.25 * offset).max(0.05))
    }
}
