//! Admission controller
//!
//! Answers "may this call proceed right now?" using a rolling request window
//! or a token bucket, per-category sub-limits and a consecutive-failure
//! circuit breaker.

mod breaker;
mod config;
mod controller;
mod stats;
mod window;

pub use breaker::CircuitState;
pub use config::AdmissionConfig;
pub use controller::{AdmissionController, AdmissionDecision, MAX_BACKOFF};
pub use stats::{AdmissionStats, BlockReason, CategoryStats};
pub use window::{SlidingWindow, TokenBucket};
