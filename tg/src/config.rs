//! Traffic governor configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::admission::AdmissionConfig;
use crate::scheduler::SchedulerConfig;

/// Main traffic governor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admission controller: rate windows, token bucket, circuit breaker, backoff
    pub admission: AdmissionConfig,

    /// Scheduler: concurrency, spacing, queues, batching
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        let a = &self.admission;
        let s = &self.scheduler;

        if a.max_requests == 0 {
            return Err(eyre::eyre!("admission.max-requests must be greater than 0"));
        }
        if a.window_ms == 0 {
            return Err(eyre::eyre!("admission.window-ms must be greater than 0"));
        }
        if a.enable_token_bucket && a.burst_size == 0 {
            return Err(eyre::eyre!("admission.burst-size must be greater than 0 when the token bucket is enabled"));
        }
        if !a.token_refill_rate.is_finite() || a.token_refill_rate < 0.0 {
            return Err(eyre::eyre!(
                "admission.token-refill-rate must be a non-negative number, got {}",
                a.token_refill_rate
            ));
        }
        if let Some((category, _)) = a.category_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(eyre::eyre!("admission.category-limits.{} must be greater than 0", category));
        }
        if a.circuit_breaker_threshold == 0 {
            return Err(eyre::eyre!("admission.circuit-breaker-threshold must be greater than 0"));
        }
        if !a.backoff_multiplier.is_finite() || a.backoff_multiplier < 1.0 {
            return Err(eyre::eyre!(
                "admission.backoff-multiplier must be at least 1.0, got {}",
                a.backoff_multiplier
            ));
        }
        if s.max_concurrent_requests == 0 {
            return Err(eyre::eyre!("scheduler.max-concurrent-requests must be greater than 0"));
        }
        if s.max_queue_size_per_priority == 0 {
            return Err(eyre::eyre!("scheduler.max-queue-size-per-priority must be greater than 0"));
        }
        if s.enable_batching && s.max_batch_size == 0 {
            return Err(eyre::eyre!("scheduler.max-batch-size must be greater than 0 when batching is enabled"));
        }
        if !(0.0..=1.0).contains(&s.smoothing_factor) {
            return Err(eyre::eyre!(
                "scheduler.smoothing-factor must be within 0.0 - 1.0, got {}",
                s.smoothing_factor
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .trafficgov.yml
        let local_config = PathBuf::from(".trafficgov.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/trafficgov/trafficgov.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("trafficgov").join("trafficgov.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
