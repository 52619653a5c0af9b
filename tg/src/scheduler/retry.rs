//! Retry eligibility

use crate::domain::{FailureKind, Priority};

/// Retries allowed for rate-limit failures
const RATE_LIMIT_RETRIES: u32 = 3;

/// Retries allowed for network failures
const NETWORK_RETRIES: u32 = 1;

/// Decide whether a failed attempt goes back into a queue
///
/// `priority` is the priority declared at enqueue time and `retry_count` the
/// number of retries already made. CRITICAL requests get at most one retry.
/// `max_retries` caps every kind.
pub fn should_retry(priority: Priority, retry_count: u32, kind: FailureKind, max_retries: u32) -> bool {
    if priority == Priority::Critical && retry_count >= 1 {
        return false;
    }
    let budget = match kind {
        FailureKind::RateLimited => RATE_LIMIT_RETRIES,
        FailureKind::Network => NETWORK_RETRIES,
        FailureKind::Other => 0,
    };
    retry_count < budget.min(max_retries)
}
