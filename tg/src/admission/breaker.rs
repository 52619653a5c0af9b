//! Consecutive-failure circuit breaker with timed auto-close

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Remaining open time, closing the breaker first if the timeout has passed
    pub fn remaining_open(&mut self, now: Instant) -> Option<Duration> {
        let opened_at = self.opened_at?;
        let elapsed = now.duration_since(opened_at);
        if elapsed >= self.timeout {
            info!(open_for_ms = elapsed.as_millis() as u64, "circuit breaker closed");
            self.close();
            return None;
        }
        Some(self.timeout - elapsed)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a failure; returns true when this failure tripped the breaker
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.opened_at.is_none() && self.consecutive_failures >= self.threshold {
            warn!(
                failures = self.consecutive_failures,
                timeout_ms = self.timeout.as_millis() as u64,
                "circuit breaker opened"
            );
            self.opened_at = Some(now);
            return true;
        }
        false
    }

    pub fn close(&mut self) {
        self.opened_at = None;
        self.consecutive_failures = 0;
    }

    /// State as of `now` without applying the auto-close
    pub fn state_at(&self, now: Instant) -> CircuitState {
        match self.opened_at {
            Some(at) if now.duration_since(at) < self.timeout => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    /// Failure count as of `now`; an expired open breaker reads as reset
    pub fn failures_at(&self, now: Instant) -> u32 {
        match self.opened_at {
            Some(at) if now.duration_since(at) >= self.timeout => 0,
            _ => self.consecutive_failures,
        }
    }
}
