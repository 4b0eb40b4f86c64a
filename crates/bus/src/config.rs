use std::time::Duration;

/// Timeouts and redelivery policy for [`crate::BusClient`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub message_timeout: Duration,
    pub redelivery_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(180),
            redelivery_interval: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl BusConfig {
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_redelivery_interval(mut self, interval: Duration) -> Self {
        self.redelivery_interval = interval;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}
