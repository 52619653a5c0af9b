//! Admission statistics

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::breaker::CircuitState;

/// Why a check was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    CircuitOpen,
    CategoryLimit,
    TokensExhausted,
    WindowFull,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::CategoryLimit => write!(f, "category limit"),
            Self::TokensExhausted => write!(f, "tokens exhausted"),
            Self::WindowFull => write!(f, "window full"),
        }
    }
}

/// Per-category counters (tracked with detailed stats only)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub allowed: u64,
    pub blocked: u64,
}

/// Snapshot of admission statistics
///
/// Counters are monotonic until `reset_stats`. The trailing fields describe
/// live rate-limiting state at the time of the snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub circuit_breaker_activations: u64,
    /// Running average of reported wait times for blocked checks
    pub average_wait_time_ms: f64,
    pub blocked_circuit_open: u64,
    pub blocked_category_limit: u64,
    pub blocked_rate_limit: u64,
    pub categories: BTreeMap<String, CategoryStats>,

    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub tokens_remaining: Option<f64>,
    pub window_requests: usize,
}

impl AdmissionStats {
    pub(crate) fn record_allowed(&mut self, category: Option<&str>, detailed: bool) {
        self.total_requests += 1;
        self.allowed_requests += 1;
        if detailed && let Some(category) = category {
            self.categories.entry(category.to_string()).or_default().allowed += 1;
        }
    }

    pub(crate) fn record_blocked(&mut self, category: Option<&str>, reason: BlockReason, wait_ms: f64, detailed: bool) {
        self.total_requests += 1;
        self.blocked_requests += 1;
        match reason {
            BlockReason::CircuitOpen => self.blocked_circuit_open += 1,
            BlockReason::CategoryLimit => self.blocked_category_limit += 1,
            BlockReason::TokensExhausted | BlockReason::WindowFull => self.blocked_rate_limit += 1,
        }
        if detailed {
            let n = self.blocked_requests as f64;
            self.average_wait_time_ms += (wait_ms - self.average_wait_time_ms) / n;
            if let Some(category) = category {
                self.categories.entry(category.to_string()).or_default().blocked += 1;
            }
        }
    }

    /// Share of checks that were allowed, 1.0 when nothing was checked
    pub fn allow_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.allowed_requests as f64 / self.total_requests as f64
        }
    }
}
