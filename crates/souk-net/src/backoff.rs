use std::time::Duration;

use rand::Rng;

use souk_shared::constants::{
    DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY_MAX_MS, DEFAULT_RECONNECT_DELAY_MS,
    RECONNECT_JITTER,
};

/// Bounded exponential backoff for reconnecting the live channel.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Retries after the first failure before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random spread applied to each delay, as a fraction of it (0.0 disables).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MAX_MS),
            jitter: RECONNECT_JITTER,
        }
    }
}

impl ReconnectPolicy {
    /// True once `attempt` (1-based) is past the ceiling.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);

        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }

        let spread = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        capped.mul_f64(factor).min(self.max_delay)
    }
}
