//! Retry policy and backoff curves

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Longest accepted backoff delay (one week)
pub const MAX_BACKOFF_DELAY_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Shape of the delay between automatic retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always `base`
    Fixed,
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Linear => write!(f, "linear"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

/// Backoff parameters; every curve is capped at `max_delay_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given failed attempt (1-based)
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        raw.min(self.max_delay_ms)
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> QueueResult<()> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(QueueError::InvalidConfig(format!(
                "base-delay-ms ({}) exceeds max-delay-ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.max_delay_ms > MAX_BACKOFF_DELAY_MS {
            return Err(QueueError::InvalidConfig(format!(
                "max-delay-ms ({}) exceeds the limit of {}",
                self.max_delay_ms, MAX_BACKOFF_DELAY_MS
            )));
        }
        Ok(())
    }
}

/// How many times an operation may run before it is left `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, never retried automatically
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
        }
    }

    /// At least one attempt and a bounded backoff
    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidConfig("max-attempts must be at least 1".to_string()));
        }
        self.backoff.validate()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}
