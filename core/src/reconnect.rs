use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnect behaviour after an abnormal closure.
///
/// The default is the backend's reference behaviour: a fixed 3 second delay
/// and no attempt limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Enable automatic reconnection on connection loss.
    pub enabled: bool,

    /// Maximum number of consecutive attempts. 0 means unlimited.
    pub max_attempts: u32,

    /// Delay before the first attempt (milliseconds).
    pub initial_delay_ms: u64,

    /// Upper bound on the delay (milliseconds).
    pub max_delay_ms: u64,

    /// 1.0 keeps the delay fixed.
    pub backoff_multiplier: f32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 0,
            initial_delay_ms: 3000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.0,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms.max(Self::default().max_delay_ms),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let multiplier = (self.backoff_multiplier as f64).max(1.0);
        let delay = base * multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay.min(self.max_delay_ms.max(self.initial_delay_ms) as f64) as u64)
    }

    /// `attempts_made` is the number of attempts already scheduled since the last open.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempts_made < self.max_attempts)
    }
}
