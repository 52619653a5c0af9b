//! Priority scheduler
//!
//! Four FIFO queues drained highest-priority first by a single dispatch loop,
//! with a concurrency cap, smoothed and adaptive inter-dispatch spacing,
//! per-type batching and demoting retries. Every execution passes through
//! the admission controller.

mod adaptive;
mod batch;
mod config;
mod core;
mod queue;
mod retry;
mod stats;

pub use config::SchedulerConfig;
pub use self::core::Scheduler;
pub use queue::{QueueLengths, RequestHandle};
pub use retry::should_retry;
pub use stats::SchedulerStats;
