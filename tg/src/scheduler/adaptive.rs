//! Adaptive inter-dispatch delay driven by the recent failure rate

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// How long outcomes are kept at all
const HISTORY_RETENTION: Duration = Duration::from_secs(300);

/// Outcomes considered when computing the failure rate
const RATE_WINDOW: Duration = Duration::from_secs(60);

const WIDEN_ABOVE: f64 = 0.20;
const NARROW_BELOW: f64 = 0.05;
const WIDEN_FACTOR: f64 = 1.5;
const NARROW_FACTOR: f64 = 0.9;
const MAX_FACTOR_OVER_MIN: u32 = 10;

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_nanos((delay.as_nanos() as f64 * factor).round() as u64)
}

#[derive(Debug, Clone)]
pub(crate) struct AdaptiveDelay {
    enabled: bool,
    min: Duration,
    current: Duration,
    history: VecDeque<(Instant, bool)>,
}

impl AdaptiveDelay {
    pub fn new(min: Duration, enabled: bool) -> Self {
        Self {
            enabled,
            min,
            current: min,
            history: VecDeque::new(),
        }
    }

    /// Record the outcome of one executed attempt
    pub fn record(&mut self, now: Instant, success: bool) {
        self.history.push_back((now, success));
        while let Some((at, _)) = self.history.front() {
            if now.duration_since(*at) > HISTORY_RETENTION {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Failure rate over the trailing minute, if anything happened in it
    pub fn failure_rate(&self, now: Instant) -> Option<f64> {
        let (total, failed) = self
            .history
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= RATE_WINDOW)
            .fold((0usize, 0usize), |(t, f), (_, ok)| (t + 1, f + usize::from(!*ok)));
        (total > 0).then(|| failed as f64 / total as f64)
    }

    /// Re-evaluate the delay against the recent failure rate and return it
    pub fn update(&mut self, now: Instant) -> Duration {
        if !self.enabled {
            return self.min;
        }
        let Some(rate) = self.failure_rate(now) else {
            return self.current;
        };

        let previous = self.current;
        if rate > WIDEN_ABOVE {
            self.current = scale(self.current, WIDEN_FACTOR).min(self.min * MAX_FACTOR_OVER_MIN);
        } else if rate < NARROW_BELOW {
            self.current = scale(self.current, NARROW_FACTOR).max(self.min);
        }
        if self.current != previous {
            debug!(
                failure_rate = rate,
                previous_ms = previous.as_millis() as u64,
                current_ms = self.current.as_millis() as u64,
                "AdaptiveDelay::update: adjusted"
            );
        }
        self.current
    }

    pub fn current(&self) -> Duration {
        if self.enabled { self.current } else { self.min }
    }
}
