//! Admission controller: rolling window, token bucket, category limits and
//! circuit breaker behind a single `check`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::breaker::{CircuitBreaker, CircuitState};
use super::config::AdmissionConfig;
use super::stats::{AdmissionStats, BlockReason};
use super::window::{SlidingWindow, TokenBucket};

/// Ceiling applied to every computed backoff delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Outcome of a single admission check
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// How long to wait before checking again (zero when allowed)
    pub wait_time: Duration,
    /// Tokens left after this check (token-bucket mode only)
    pub tokens_remaining: Option<f64>,
    pub category: Option<String>,
    pub reason: Option<BlockReason>,
}

struct AdmissionState {
    window: SlidingWindow,
    bucket: Option<TokenBucket>,
    categories: HashMap<String, SlidingWindow>,
    breaker: CircuitBreaker,
    stats: AdmissionStats,
}

/// Decides whether a unit of work may proceed right now
///
/// Never errors: every call yields a decision. Only `record_success` and
/// `record_failure` feed the circuit breaker.
pub struct AdmissionController {
    config: AdmissionConfig,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        debug!(?config, "AdmissionController::new: called");
        let now = Instant::now();
        let bucket = config
            .enable_token_bucket
            .then(|| TokenBucket::new(config.burst_size, config.token_refill_rate, now));
        let state = AdmissionState {
            window: SlidingWindow::new(config.max_requests, config.window()),
            bucket,
            categories: HashMap::new(),
            breaker: CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_timeout()),
            stats: AdmissionStats::default(),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether a request (optionally in `category`) may proceed now
    ///
    /// Allowing consumes a token (bucket mode) or a window slot, plus a slot
    /// in the category window when the category has a limit.
    pub fn check(&self, category: Option<&str>) -> AdmissionDecision {
        let now = Instant::now();
        let detailed = self.config.enable_detailed_stats;
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(wait) = state.breaker.remaining_open(now) {
            return Self::blocked(state, category, BlockReason::CircuitOpen, wait, detailed);
        }

        if let Some(category) = category
            && let Some(limit) = self.config.category_limits.get(category)
        {
            let window = state
                .categories
                .entry(category.to_string())
                .or_insert_with(|| SlidingWindow::new(*limit, self.config.window()));
            window.prune(now);
            if window.is_full() {
                let wait = window.wait_time(now);
                return Self::blocked(state, Some(category), BlockReason::CategoryLimit, wait, detailed);
            }
        }

        let tokens_remaining = match state.bucket.as_mut() {
            Some(bucket) => {
                bucket.refill(now);
                if !bucket.try_take() {
                    let wait = bucket.time_to_next_token();
                    return Self::blocked(state, category, BlockReason::TokensExhausted, wait, detailed);
                }
                Some(bucket.tokens())
            }
            None => {
                state.window.prune(now);
                if state.window.is_full() {
                    let wait = state.window.wait_time(now);
                    return Self::blocked(state, category, BlockReason::WindowFull, wait, detailed);
                }
                state.window.record(now);
                None
            }
        };

        if let Some(category) = category
            && let Some(window) = state.categories.get_mut(category)
        {
            window.record(now);
        }

        state.stats.record_allowed(category, detailed);
        AdmissionDecision {
            allowed: true,
            wait_time: Duration::ZERO,
            tokens_remaining,
            category: category.map(str::to_string),
            reason: None,
        }
    }

    fn blocked(
        state: &mut AdmissionState,
        category: Option<&str>,
        reason: BlockReason,
        wait: Duration,
        detailed: bool,
    ) -> AdmissionDecision {
        debug!(?category, %reason, wait_ms = wait.as_millis() as u64, "AdmissionController::check: blocked");
        state
            .stats
            .record_blocked(category, reason, wait.as_secs_f64() * 1000.0, detailed);
        AdmissionDecision {
            allowed: false,
            wait_time: wait,
            tokens_remaining: state.bucket.as_ref().map(TokenBucket::tokens),
            category: category.map(str::to_string),
            reason: Some(reason),
        }
    }

    /// Reset the consecutive-failure streak
    pub fn record_success(&self) {
        self.lock().breaker.record_success();
    }

    /// Count a failure of executed work, opening the breaker at the threshold
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.breaker.record_failure(now) {
            state.stats.circuit_breaker_activations += 1;
        }
    }

    /// `retry_delay * backoff_multiplier^attempt`, capped at `MAX_BACKOFF`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let ms = self.config.retry_delay().as_millis() as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped = ms.min(MAX_BACKOFF.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock().breaker.state_at(Instant::now())
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_state() == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().breaker.failures_at(Instant::now())
    }

    /// Force the breaker closed and clear the failure streak
    pub fn reset_circuit(&self) {
        debug!("AdmissionController::reset_circuit: called");
        self.lock().breaker.close();
    }

    /// Statistics snapshot; does not alter rate-limiting state
    pub fn stats(&self) -> AdmissionStats {
        let now = Instant::now();
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.circuit_state = state.breaker.state_at(now);
        stats.consecutive_failures = state.breaker.failures_at(now);
        stats.tokens_remaining = state.bucket.as_ref().map(|b| b.peek(now));
        stats.window_requests = state.window.live_count(now);
        stats
    }

    /// Zero the counters; windows, tokens and breaker are untouched
    pub fn reset_stats(&self) {
        debug!("AdmissionController::reset_stats: called");
        self.lock().stats = AdmissionStats::default();
    }

    fn refill_now(&self) {
        let now = Instant::now();
        if let Some(bucket) = self.lock().bucket.as_mut() {
            bucket.refill(now);
        }
    }

    /// Periodically refresh the token bucket so `stats` stays current
    ///
    /// The task ends once the controller is dropped.
    pub fn spawn_refill_ticker(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        debug!(?period, "AdmissionController::spawn_refill_ticker: called");
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(controller) => controller.refill_now(),
                    None => break,
                }
            }
        })
    }
}
