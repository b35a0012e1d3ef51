use std::time::Duration;

/// Backoff strategy between job attempts
#[derive(Clone, Debug)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// delay = min(base * 2^(attempt - 1), max)
    Exponential { max: Duration },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            max: Duration::from_secs(30),
        }
    }
}

/// Retry policy applied by queue workers
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3, // 1 initial + 2 retries
            delay: Duration::from_secs(1),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            delay: base,
            backoff: BackoffStrategy::Exponential { max },
        }
    }

    /// Attempts actually allowed; zero is clamped to one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        match &self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential { max } => {
                let exponent = failed_attempts.saturating_sub(1).min(31);
                self.delay
                    .checked_mul(2_u32.saturating_pow(exponent))
                    .unwrap_or(*max)
                    .min(*max)
            }
        }
    }

    /// Whether a job that has failed `failed_attempts` times may run again.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.attempts()
    }
}

/// Trait for errors that may be retryable
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
