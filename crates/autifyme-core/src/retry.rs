//! RetryPolicy: per error-class retry decisions.
//!
//! Backoff is never slept in-process: a retry decision carries a
//! "not before" timestamp that an external scheduler (timer, cron, queue)
//! uses to drive re-invocation.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`
    Exponential {
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_retries: u32,
    },
    /// `delay * attempt`
    Linear { delay_ms: u64, max_retries: u32 },
    NoRetry,
}

impl RetryStrategy {
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::Exponential { max_retries, .. } | Self::Linear { max_retries, .. } => *max_retries,
            Self::NoRetry => 0,
        }
    }

    /// Delay before the given retry attempt (1-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        match self {
            Self::Exponential {
                base_delay_ms,
                max_delay_ms,
                ..
            } => base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
                .min(*max_delay_ms),
            Self::Linear { delay_ms, .. } => delay_ms.saturating_mul(attempt as u64),
            Self::NoRetry => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-invoke the same step, not before the given instant.
    Retry {
        attempt: u32,
        not_before: DateTime<Utc>,
    },
    /// Retries exhausted, or the class is not retryable.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    default: RetryStrategy,
    classes: HashMap<String, RetryStrategy>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            default: config.default.clone(),
            classes: config.classes.clone(),
        }
    }

    pub fn with_class(mut self, class: impl Into<String>, strategy: RetryStrategy) -> Self {
        self.classes.insert(class.into(), strategy);
        self
    }

    pub fn strategy_for(&self, error_class: &str) -> &RetryStrategy {
        self.classes.get(error_class).unwrap_or(&self.default)
    }

    /// Decide what to do after a retryable failure.
    ///
    /// `retries_so_far` counts retries already scheduled for the step; the
    /// first failure passes 0.
    pub fn decide(&self, error_class: &str, retries_so_far: u32, now: DateTime<Utc>) -> RetryDecision {
        let strategy = self.strategy_for(error_class);
        if retries_so_far >= strategy.max_retries() {
            return RetryDecision::GiveUp;
        }
        let attempt = retries_so_far + 1;
        let delay = strategy.delay_ms(attempt);
        RetryDecision::Retry {
            attempt,
            not_before: now + Duration::milliseconds(delay.min(i64::MAX as u64) as i64),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
