//! Circuit breaker for a single provider.
//!
//! - Closed: requests allowed, consecutive failures counted
//! - Open: provider skipped until the cool-down window elapses
//! - Half-open: cool-down elapsed, one trial request is let through and its
//!   outcome decides (success closes, failure re-opens). A trial that never
//!   reports back is re-granted after another cool-down.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    /// Set while the half-open trial is outstanding
    trial_started_at: Option<DateTime<Utc>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::seconds(config.cooldown_secs.min(i64::MAX as u64) as i64),
        }
    }

    /// Current state, moving Open → HalfOpen once the cool-down has elapsed.
    pub fn state_at(&mut self, now: DateTime<Utc>) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if now - opened_at >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                }
            }
        }
        self.state
    }

    /// Whether a request may go to the provider now. In half-open only the
    /// first caller gets through until an outcome is recorded.
    pub fn allows_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.state_at(now) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => match self.trial_started_at {
                Some(started) if now - started < self.cooldown => false,
                _ => {
                    self.trial_started_at = Some(now);
                    true
                }
            },
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_started_at = None;
        self.state = CircuitState::Closed;
    }

    /// Returns true when this failure opened the circuit.
    pub fn record_failure_at(&mut self, now: DateTime<Utc>) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let should_open = match self.state_at(now) {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            self.trial_started_at = None;
        }
        should_open
    }
}
