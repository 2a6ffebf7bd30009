//! Retry logic with exponential backoff
//!
//! Uploads are restarted whole on every attempt; this module only decides how
//! many attempts a task gets and how long to wait between them.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::core::error::StorageError;

/// Default attempt ceiling per upload task
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Options for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryOptions {
    /// Options that retry immediately, used by tests and local backends
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after `attempt` (1-based) has failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if secs.is_nan() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }
}

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        StorageError::is_retryable(self)
    }
}

/// Retry manager for short storage calls such as container checks
pub struct RetryManager {
    options: RetryOptions,
}

impl RetryManager {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// Execute the given async operation, retrying retryable errors
    pub async fn retry<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if !error.is_retryable() || !self.options.has_attempts_left(attempt) {
                        return Err(error);
                    }

                    tracing::debug!(attempt, %error, "Retrying storage call");
                    sleep(self.options.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
