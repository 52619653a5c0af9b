//! Synthetic exchange workload for exercising the governor end to end

use std::time::Duration;

use eyre::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::domain::{GovernorError, Priority, WorkError};
use crate::scheduler::{Scheduler, SchedulerStats};

/// Request types the simulated client issues, with the priority each uses
const WORKLOAD: &[(&str, Priority)] = &[
    ("order", Priority::Critical),
    ("cancel", Priority::Critical),
    ("order-query", Priority::High),
    ("account", Priority::Normal),
    ("market-data", Priority::Normal),
    ("history", Priority::Low),
];

/// Messages the simulated exchange fails with; classified like real transport errors
const FAILURES: &[&str] = &[
    "HTTP 429 Too Many Requests",
    "connect ECONNRESET 10.0.0.1:443",
    "request timed out",
    "order rejected: insufficient balance",
];

const MIN_LATENCY_MS: u64 = 5;
const MAX_LATENCY_MS: u64 = 50;

/// How long a refill tick waits between bucket refreshes
const REFILL_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub requests: usize,
    /// Probability that any single attempt fails
    pub failure_rate: f64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            requests: 50,
            failure_rate: 0.1,
        }
    }
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub submitted: usize,
    pub rejected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub stats: SchedulerStats,
}

/// One simulated exchange call: random latency, then success or a random failure
async fn exchange_call(seq: usize, failure_rate: f64) -> Result<usize, WorkError> {
    // ThreadRng is not Send; draw everything before the first await
    let (latency, failure) = {
        let mut rng = rand::rng();
        let latency = Duration::from_millis(rng.random_range(MIN_LATENCY_MS..=MAX_LATENCY_MS));
        let failure = rng
            .random_bool(failure_rate)
            .then(|| FAILURES[rng.random_range(0..FAILURES.len())]);
        (latency, failure)
    };

    tokio::time::sleep(latency).await;
    match failure {
        Some(message) => Err(WorkError::classify(message)),
        None => Ok(seq),
    }
}

/// Submit `options.requests` synthetic calls and wait for every outcome
pub async fn run(config: &Config, options: &SimulationOptions) -> Result<SimulationReport> {
    debug!(?options, "simulate::run: called");
    if !(0.0..=1.0).contains(&options.failure_rate) {
        return Err(eyre::eyre!(
            "failure rate must be within 0.0 - 1.0, got {}",
            options.failure_rate
        ));
    }

    let scheduler: Scheduler<usize> = Scheduler::from_config(config);
    let ticker = config
        .admission
        .enable_token_bucket
        .then(|| scheduler.admission().spawn_refill_ticker(REFILL_PERIOD));

    let started = Instant::now();
    let mut handles = Vec::with_capacity(options.requests);
    let mut rejected = 0;

    for seq in 0..options.requests {
        let (request_type, priority) = WORKLOAD[seq % WORKLOAD.len()];
        let failure_rate = options.failure_rate;
        let metadata = serde_json::json!({ "seq": seq, "symbol": "BTC-USDT" });
        match scheduler.enqueue(
            request_type,
            priority,
            move || exchange_call(seq, failure_rate),
            Some(metadata),
        ) {
            Ok(handle) => handles.push(handle),
            Err(e) if e.is_rejection() => {
                debug!(seq, error = %e, "simulate::run: rejected");
                rejected += 1;
            }
            Err(e) => return Err(eyre::eyre!("Unexpected enqueue error: {}", e)),
        }
    }

    let mut succeeded = 0;
    let mut failed = 0;
    for handle in handles {
        match handle.await {
            Ok(_) => succeeded += 1,
            Err(GovernorError::Failed { .. }) | Err(GovernorError::Dropped(_)) => failed += 1,
            Err(e) => return Err(eyre::eyre!("Unexpected outcome: {}", e)),
        }
    }

    if let Some(ticker) = ticker {
        ticker.abort();
    }
    scheduler.stop();

    let report = SimulationReport {
        submitted: options.requests,
        rejected,
        succeeded,
        failed,
        elapsed_ms: started.elapsed().as_millis() as u64,
        stats: scheduler.stats(),
    };
    info!(
        submitted = report.submitted,
        succeeded, failed, rejected, "Simulation finished"
    );
    Ok(report)
}
