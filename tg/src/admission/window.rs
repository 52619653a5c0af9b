//! Rate accounting primitives: sliding window and token bucket

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Timestamps of allowed requests inside a rolling window
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            stamps: VecDeque::with_capacity(limit.min(1024) as usize),
        }
    }

    /// Drop timestamps that have left the window (keeps `now - t < window`)
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.stamps.len() >= self.limit as usize
    }

    /// Time until the oldest timestamp exits the window
    pub fn wait_time(&self, now: Instant) -> Duration {
        match self.stamps.front() {
            Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
    }

    /// Entries still inside the window at `now`, without pruning
    pub fn live_count(&self, now: Instant) -> usize {
        self.stamps
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

/// Continuous-refill token bucket
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

// Absorbs float drift in `elapsed * rate` so a full token is not missed.
const TOKEN_EPSILON: f64 = 1e-9;

impl TokenBucket {
    /// Create a bucket that starts full
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn projected(&self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    pub fn refill(&mut self, now: Instant) {
        self.tokens = self.projected(now);
        self.last_refill = now;
    }

    pub fn has_token(&self) -> bool {
        self.tokens + TOKEN_EPSILON >= 1.0
    }

    /// Consume one token; returns false when the bucket is short
    pub fn try_take(&mut self) -> bool {
        if !self.has_token() {
            return false;
        }
        self.tokens = (self.tokens - 1.0).max(0.0);
        true
    }

    /// Time until one whole token is available at the refill rate
    pub fn time_to_next_token(&self) -> Duration {
        if self.has_token() {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        let secs = (1.0 - self.tokens) / self.refill_rate;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Token count as of `now`, without mutating the bucket
    pub fn peek(&self, now: Instant) -> f64 {
        self.projected(now)
    }
}
