//! Error types for units of work and governor operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::priority::Priority;
use super::request::RequestId;

/// Failure reported by a unit of work
///
/// Callers that talk to the exchange should map their transport errors into
/// one of these kinds where the failure is produced. `WorkError::classify`
/// exists for callers that only have an error message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

/// Retry-relevant classification of a `WorkError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    RateLimited,
    Network,
    Other,
}

const RATE_LIMIT_MARKERS: &[&str] = &["429", "rate limit", "rate-limit", "too many requests"];

const NETWORK_MARKERS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "etimedout",
    "enotfound",
    "socket hang up",
    "network",
    "timeout",
    "timed out",
];

impl WorkError {
    /// Build an error from a bare message by sniffing for known markers
    ///
    /// Rate-limit markers win over network markers when both appear.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::RateLimited(message)
        } else if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::Network(message)
        } else {
            Self::Other(message)
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RateLimited(_) => FailureKind::RateLimited,
            Self::Network(_) => FailureKind::Network,
            Self::Other(_) => FailureKind::Other,
        }
    }

    /// Check if this failure is transient (eligible for some retry budget)
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

/// Errors surfaced to callers of the governor
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("Queue for {priority} priority is full (capacity {capacity})")]
    QueueFull { priority: Priority, capacity: usize },

    #[error("Request submission is paused")]
    Paused,

    #[error("Scheduler is stopped")]
    Stopped,

    #[error("Request {id} failed after {attempts} attempt(s): {source}")]
    Failed {
        id: RequestId,
        attempts: u32,
        #[source]
        source: WorkError,
    },

    #[error("Request {0} was dropped by the scheduler before completion")]
    Dropped(RequestId),
}

impl GovernorError {
    /// Check if the request was turned away before entering any queue
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::Paused | Self::Stopped)
    }

    /// The underlying work failure, if this is a terminal execution failure
    pub fn work_error(&self) -> Option<&WorkError> {
        match self {
            Self::Failed { source, .. } => Some(source),
            _ => None,
        }
    }
}
