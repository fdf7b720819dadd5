//! Retry policy — exponential backoff for failed node executions.

use std::time::Duration;

use tempo_domain::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_secs_f64(config.backoff_base_secs),
            backoff_multiplier: config.backoff_multiplier,
            max_backoff: Duration::from_secs_f64(config.max_backoff_secs),
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retrying after a failed `attempt` (1-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.backoff_base.mul_f64(factor);
        delay.min(self.max_backoff)
    }

    pub async fn wait_before_retry(&self, attempt: u32) {
        let delay = self.next_delay(attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "retry backoff");
        tokio::time::sleep(delay).await;
    }
}
