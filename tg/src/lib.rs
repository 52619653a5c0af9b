//! TrafficGov - client-side traffic governor for rate-limited exchange APIs
//!
//! Sits between an application and a remote API and decides when each
//! outbound call may run, so the client stays inside server-side rate limits
//! while urgent calls jump ahead of routine ones.
//!
//! # Modules
//!
//! - [`admission`] - Rolling window, token bucket, category limits, circuit breaker
//! - [`scheduler`] - Priority queues, dispatch loop, batching and retries
//! - [`domain`] - Priorities, request ids and error types
//! - [`config`] - Configuration types and loading
//! - [`simulate`] - Synthetic workload driver
//! - [`cli`] - Command-line interface

pub mod admission;
pub mod cli;
pub mod config;
pub mod domain;
pub mod scheduler;
pub mod simulate;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionDecision, AdmissionStats};
pub use config::Config;
pub use domain::{GovernorError, Priority, RequestId, WorkError};
pub use scheduler::{RequestHandle, Scheduler, SchedulerConfig, SchedulerStats};
