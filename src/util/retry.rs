//! Exponential backoff with jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SwarmError;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts after the first failure.
    pub max_attempts: u32,
    /// Initial backoff duration.
    #[serde(with = "crate::config::duration_ms")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    #[serde(with = "crate::config::duration_ms")]
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), before jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let cap = self.max_backoff.as_secs_f64();
        let secs = self.initial_backoff.as_secs_f64() * multiplier.powi(exponent);
        let secs = if secs.is_finite() { secs.min(cap) } else { cap };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Backoff before retry number `attempt` (1-based), with 75%–125% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter_factor = 0.75 + (rand_factor() * 0.5);
        Duration::from_secs_f64(self.base_backoff(attempt).as_secs_f64() * jitter_factor)
    }

    /// Reject policies whose delays would shrink or never settle.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(SwarmError::Configuration(format!(
                "reconnect multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(SwarmError::Configuration(format!(
                "reconnect initial_backoff ({}ms) exceeds max_backoff ({}ms)",
                self.initial_backoff.as_millis(),
                self.max_backoff.as_millis()
            )));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// Simple pseudo-random factor [0, 1) without pulling in rand crate.
fn rand_factor() -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);

    let hash = hasher.finish();
    (hash % 10000) as f64 / 10000.0
}
