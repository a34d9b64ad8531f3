use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Backoff between failed reconcile passes of one principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures after which the record is flagged `ProvisioningFailed`.
    /// Retries continue at the capped delay afterwards.
    pub budget: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_budget(mut self, budget: u32) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn with_max_delay(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    /// Delay before the retry following failure number `failures` (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(64) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        let delay = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    pub fn exhausted(&self, failures: u32) -> bool { failures >= self.budget }

    pub fn validate(&self) -> AppResult<()> {
        if self.budget == 0 {
            return Err(AppError::user("invalid_retry", "retry budget must be greater than 0"));
        }
        if self.initial_delay_ms == 0 {
            return Err(AppError::user("invalid_retry", "initial retry delay must be positive"));
        }
        if self.multiplier < 1.0 {
            return Err(AppError::user("invalid_retry", "retry multiplier must be at least 1"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(AppError::user("invalid_retry", "max retry delay must be at least the initial delay"));
        }
        Ok(())
    }
}
