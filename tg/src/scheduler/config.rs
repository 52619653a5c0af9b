//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Max units of work executing at once
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Floor for the spacing between dispatches, in milliseconds
    #[serde(default = "default_min_request_delay_ms")]
    pub min_request_delay_ms: u64,

    /// Capacity of each priority queue
    #[serde(default = "default_max_queue_size_per_priority")]
    pub max_queue_size_per_priority: usize,

    /// Accumulate batchable request types before dispatch
    #[serde(default = "default_enable_batching")]
    pub enable_batching: bool,

    /// How long a batch may wait for more items after its first arrival
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// A batch flushes as soon as it holds this many items
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Request types eligible for batching
    #[serde(default = "default_batchable_types")]
    pub batchable_types: Vec<String>,

    /// Widen dispatch spacing when the recent failure rate climbs
    #[serde(default = "default_enable_adaptive_rate_limit")]
    pub enable_adaptive_rate_limit: bool,

    /// Jitter fraction applied on top of the dispatch spacing (0.0 - 1.0)
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,
}

fn default_max_concurrent_requests() -> usize {
    5
}

fn default_min_request_delay_ms() -> u64 {
    100
}

fn default_max_queue_size_per_priority() -> usize {
    1000
}

fn default_enable_batching() -> bool {
    true
}

fn default_batch_window_ms() -> u64 {
    100
}

fn default_max_batch_size() -> usize {
    10
}

fn default_batchable_types() -> Vec<String> {
    vec!["market-data".to_string()]
}

fn default_enable_adaptive_rate_limit() -> bool {
    true
}

fn default_smoothing_factor() -> f64 {
    0.1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            min_request_delay_ms: default_min_request_delay_ms(),
            max_queue_size_per_priority: default_max_queue_size_per_priority(),
            enable_batching: default_enable_batching(),
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            batchable_types: default_batchable_types(),
            enable_adaptive_rate_limit: default_enable_adaptive_rate_limit(),
            smoothing_factor: default_smoothing_factor(),
        }
    }
}

impl SchedulerConfig {
    pub fn min_request_delay(&self) -> Duration {
        Duration::from_millis(self.min_request_delay_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Check if requests of this type go through the batch accumulator
    pub fn is_batchable(&self, request_type: &str) -> bool {
        self.enable_batching && self.batchable_types.iter().any(|t| t == request_type)
    }
}
