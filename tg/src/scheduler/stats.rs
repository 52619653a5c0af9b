//! Statistics for the scheduler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::AdmissionStats;

use super::queue::QueueLengths;

/// Monotonic scheduler counters
#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    pub enqueued: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub attempts: u64,
    pub batches: u64,
    pub batched_requests: u64,
    pub average_execution_ms: f64,
}

impl Counters {
    /// Fold one attempt's execution time into the running average
    pub fn record_attempt(&mut self, execution_ms: f64) {
        self.attempts += 1;
        self.average_execution_ms += (execution_ms - self.average_execution_ms) / self.attempts as f64;
    }
}

/// Snapshot of scheduler and admission statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_enqueued: u64,
    pub total_rejected: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_attempts: u64,
    pub total_batches: u64,
    pub total_batched_requests: u64,
    pub average_execution_ms: f64,
    /// Successful completions per second since the last reset
    pub throughput_per_sec: f64,
    pub queued: QueueLengths,
    pub batched_pending: usize,
    pub retries_pending: usize,
    pub active: usize,
    pub current_delay_ms: u64,
    pub paused: bool,
    pub stopped: bool,
    pub since: DateTime<Utc>,
    pub admission: AdmissionStats,
}

impl SchedulerStats {
    /// Share of finished requests that succeeded, 1.0 when none finished
    pub fn success_rate(&self) -> f64 {
        let finished = self.total_succeeded + self.total_failed;
        if finished == 0 {
            1.0
        } else {
            self.total_succeeded as f64 / finished as f64
        }
    }
}
