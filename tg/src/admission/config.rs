//! Admission controller configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Admission controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AdmissionConfig {
    /// Max requests allowed inside one rolling window
    pub max_requests: u32,

    /// Rolling window length in milliseconds
    pub window_ms: u64,

    /// Use the token bucket instead of the global sliding window
    pub enable_token_bucket: bool,

    /// Token bucket ceiling (burst allowance)
    pub burst_size: u32,

    /// Tokens added per second
    pub token_refill_rate: f64,

    /// Per-category request caps, each counted over `window_ms`
    pub category_limits: HashMap<String, u32>,

    /// Consecutive failures that trip the breaker
    pub circuit_breaker_threshold: u32,

    /// How long the breaker stays open, in milliseconds
    pub circuit_breaker_timeout_ms: u64,

    /// Base retry delay in milliseconds
    pub retry_delay_ms: u64,

    /// Growth factor applied per retry attempt
    pub backoff_multiplier: f64,

    /// Upper bound on retries for any request
    pub max_retries: u32,

    /// Track per-category counters and the running average wait
    pub enable_detailed_stats: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 60_000,
            enable_token_bucket: false,
            burst_size: 10,
            token_refill_rate: 1.0,
            category_limits: HashMap::new(),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 60_000,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_retries: 3,
            enable_detailed_stats: true,
        }
    }
}

impl AdmissionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
