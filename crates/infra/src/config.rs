//! Pipeline tuning knobs.
//!
//! Every knob is a plain number; durations are whole seconds. Unset fields
//! take the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batches::SealPolicy;
use crate::breaker::CircuitBreakerConfig;
use crate::jobs::{RecoveryConfig, RetryPolicy, WorkerConfig, MAX_BACKOFF_EXPONENT, MAX_RETRY_DELAY};

/// Upper bound for every duration knob.
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be at most {max} seconds, got {value}")]
    TooLong {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("retry_jitter must be within [0, 1], got {0}")]
    Jitter(f64),

    #[error("stuck_timeout_secs ({stuck}) must exceed lock_timeout_secs ({lock})")]
    StuckBeforeLock { stuck: u64, lock: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size_threshold: u64,
    pub batch_time_window_secs: u64,
    pub sealer_interval_secs: u64,
    pub creator_interval_secs: u64,
    pub worker_poll_interval_secs: u64,
    pub worker_concurrency: usize,
    pub lock_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_retry_delay_secs: u64,
    pub retry_jitter: f64,
    pub analysis_timeout_secs: u64,
    pub recovery_interval_secs: u64,
    pub stuck_timeout_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub breaker_half_open_max: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size_threshold: 100,
            batch_time_window_secs: 10 * 60,
            sealer_interval_secs: 60,
            creator_interval_secs: 120,
            worker_poll_interval_secs: 5,
            worker_concurrency: 1,
            lock_timeout_secs: 10 * 60,
            max_attempts: 5,
            base_retry_delay_secs: 30,
            retry_jitter: 0.1,
            analysis_timeout_secs: 120,
            recovery_interval_secs: 60,
            stuck_timeout_secs: 15 * 60,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 600,
            breaker_half_open_max: 1,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 14] = [
            ("batch_size_threshold", self.batch_size_threshold),
            ("batch_time_window_secs", self.batch_time_window_secs),
            ("sealer_interval_secs", self.sealer_interval_secs),
            ("creator_interval_secs", self.creator_interval_secs),
            ("worker_poll_interval_secs", self.worker_poll_interval_secs),
            ("worker_concurrency", self.worker_concurrency as u64),
            ("lock_timeout_secs", self.lock_timeout_secs),
            ("max_attempts", self.max_attempts as u64),
            ("analysis_timeout_secs", self.analysis_timeout_secs),
            ("recovery_interval_secs", self.recovery_interval_secs),
            ("stuck_timeout_secs", self.stuck_timeout_secs),
            ("breaker_failure_threshold", self.breaker_failure_threshold as u64),
            ("breaker_cooldown_secs", self.breaker_cooldown_secs),
            ("breaker_half_open_max", self.breaker_half_open_max as u64),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }

        let durations: [(&'static str, u64); 9] = [
            ("batch_time_window_secs", self.batch_time_window_secs),
            ("sealer_interval_secs", self.sealer_interval_secs),
            ("creator_interval_secs", self.creator_interval_secs),
            ("worker_poll_interval_secs", self.worker_poll_interval_secs),
            ("lock_timeout_secs", self.lock_timeout_secs),
            ("analysis_timeout_secs", self.analysis_timeout_secs),
            ("recovery_interval_secs", self.recovery_interval_secs),
            ("stuck_timeout_secs", self.stuck_timeout_secs),
            ("breaker_cooldown_secs", self.breaker_cooldown_secs),
        ];
        if let Some(&(field, value)) = durations.iter().find(|(_, v)| *v > MAX_DURATION_SECS) {
            return Err(ConfigError::TooLong {
                field,
                value,
                max: MAX_DURATION_SECS,
            });
        }

        // The largest backoff step must fit under the retry ceiling.
        let max_base = MAX_RETRY_DELAY.as_secs() >> MAX_BACKOFF_EXPONENT;
        if self.base_retry_delay_secs > max_base {
            return Err(ConfigError::TooLong {
                field: "base_retry_delay_secs",
                value: self.base_retry_delay_secs,
                max: max_base,
            });
        }

        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::Jitter(self.retry_jitter));
        }

        if self.stuck_timeout_secs <= self.lock_timeout_secs {
            return Err(ConfigError::StuckBeforeLock {
                stuck: self.stuck_timeout_secs,
                lock: self.lock_timeout_secs,
            });
        }

        Ok(())
    }

    pub fn seal_policy(&self) -> SealPolicy {
        SealPolicy {
            size_threshold: self.batch_size_threshold,
            time_window: secs(self.batch_time_window_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, secs(self.base_retry_delay_secs))
            .with_jitter(self.retry_jitter)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            cooldown: secs(self.breaker_cooldown_secs),
            half_open_max_requests: self.breaker_half_open_max,
            ..Default::default()
        }
    }

    /// Config for worker number `index`.
    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig {
            name: format!("worker-{index}"),
            poll_interval: secs(self.worker_poll_interval_secs),
            lock_timeout: secs(self.lock_timeout_secs),
            analysis_timeout: secs(self.analysis_timeout_secs),
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            interval: secs(self.recovery_interval_secs),
            stuck_timeout: secs(self.stuck_timeout_secs),
            ..Default::default()
        }
    }

    pub fn sealer_interval(&self) -> Duration {
        secs(self.sealer_interval_secs)
    }

    pub fn creator_interval(&self) -> Duration {
        secs(self.creator_interval_secs)
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}
