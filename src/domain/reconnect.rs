//! Reconnect delay policy for outbound station connections

use serde::Deserialize;
use std::time::Duration;

/// Used when neither the current delay nor the initial delay is usable
pub const FALLBACK_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_secs: u64,
    /// 0 disables clamping
    pub max_delay_secs: u64,
    pub use_exponential_backoff: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { initial_delay_secs: 10, max_delay_secs: 60, use_exponential_backoff: true }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Normalize a delay: zero falls back to the initial delay, then to
    /// `FALLBACK_DELAY`, and the result is clamped to the maximum when set.
    pub fn ensure_valid_delay(&self, current: Duration) -> Duration {
        let mut delay = current;
        if delay.is_zero() {
            delay = self.initial_delay();
        }
        if delay.is_zero() {
            delay = FALLBACK_DELAY;
        }
        self.clamp(delay)
    }

    /// Delay to wait after `previous` failed
    pub fn next_delay(&self, previous: Duration) -> Duration {
        if !self.use_exponential_backoff {
            return self.ensure_valid_delay(previous);
        }
        let base = if previous.is_zero() { self.ensure_valid_delay(self.initial_delay()) } else { previous };
        self.clamp(base.saturating_mul(2))
    }

    fn clamp(&self, delay: Duration) -> Duration {
        let max = self.max_delay();
        if !max.is_zero() && delay > max {
            max
        } else {
            delay
        }
    }
}
