// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the timecard engine.
//!
//! # Example
//!
//! ```
//! use timecard_engine::TimecardConfig;
//!
//! // Minimal config (uses defaults)
//! let config = TimecardConfig::default();
//! assert_eq!(config.l1_capacity, 5000);
//! assert_eq!(config.batch_flush_count, 150);
//!
//! // Override a few knobs
//! let config = TimecardConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     circuit_failure_threshold: 3,
//!     batch_max_flush_interval_ms: 5_000,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0}")]
    Inconsistent(String),
}

/// Configuration for the timecard engine.
///
/// All fields have defaults, so an empty document deserializes to a working
/// configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TimecardConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Key prefix applied by the Redis adapter (e.g., "timecard:")
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// L1: hot entries, LRU
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,
    #[serde(default = "default_l1_ttl_secs")]
    pub l1_ttl_secs: u64,
    /// L2: warm entries, LFU with decay
    #[serde(default = "default_l2_capacity")]
    pub l2_capacity: usize,
    #[serde(default = "default_l2_ttl_secs")]
    pub l2_ttl_secs: u64,
    #[serde(default = "default_l2_decay_interval_secs")]
    pub l2_decay_interval_secs: u64,
    /// Access count above which an L1 eviction demotes to L2 instead of dropping
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: u64,

    /// Batch flush triggers
    #[serde(default = "default_batch_flush_count")]
    pub batch_flush_count: usize,
    #[serde(default = "default_batch_max_flush_interval_ms")]
    pub batch_max_flush_interval_ms: u64,
    #[serde(default = "default_batch_critical_latency_ms")]
    pub batch_critical_latency_ms: u64,
    /// Upper bound on operations sent in one store call
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// Circuit breaker
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_cooldown_ms")]
    pub circuit_cooldown_ms: u64,
    #[serde(default = "default_store_call_timeout_ms")]
    pub store_call_timeout_ms: u64,

    /// Session records
    #[serde(default = "default_active_session_ttl_secs")]
    pub active_session_ttl_secs: u64,
    #[serde(default = "default_archive_ttl_secs")]
    pub archive_ttl_secs: u64,
    #[serde(default = "default_max_session_secs")]
    pub max_session_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Category configuration
    #[serde(default = "default_category_ttl_secs")]
    pub category_ttl_secs: u64,
    #[serde(default = "default_max_categories")]
    pub max_categories: usize,

    /// Health
    #[serde(default = "default_latency_window_secs")]
    pub latency_window_secs: u64,
    #[serde(default = "default_queue_degraded_depth")]
    pub queue_degraded_depth: usize,
    #[serde(default = "default_queue_unhealthy_depth")]
    pub queue_unhealthy_depth: usize,
    /// Reporter period in seconds (0 = disabled)
    #[serde(default = "default_health_report_interval_secs")]
    pub health_report_interval_secs: u64,
}

fn default_l1_capacity() -> usize { 5_000 }
fn default_l1_ttl_secs() -> u64 { 300 }
fn default_l2_capacity() -> usize { 15_000 }
fn default_l2_ttl_secs() -> u64 { 1_800 }
fn default_l2_decay_interval_secs() -> u64 { 60 }
fn default_promotion_threshold() -> u64 { 2 }
fn default_batch_flush_count() -> usize { 150 }
fn default_batch_max_flush_interval_ms() -> u64 { 20_000 }
fn default_batch_critical_latency_ms() -> u64 { 500 }
fn default_batch_max_size() -> usize { 500 }
fn default_max_queue_size() -> usize { 15_000 }
fn default_max_write_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 1_000 }
fn default_max_retry_delay_ms() -> u64 { 60_000 }
fn default_dead_letter_capacity() -> usize { 1_000 }
fn default_circuit_failure_threshold() -> u32 { 5 }
fn default_circuit_cooldown_ms() -> u64 { 60_000 }
fn default_store_call_timeout_ms() -> u64 { 10_000 }
fn default_active_session_ttl_secs() -> u64 { 86_400 }
fn default_archive_ttl_secs() -> u64 { 30 * 86_400 }
fn default_max_session_secs() -> u64 { 86_400 }
fn default_history_limit() -> usize { 50 }
fn default_category_ttl_secs() -> u64 { 365 * 86_400 }
fn default_max_categories() -> usize { 50 }
fn default_latency_window_secs() -> u64 { 300 }
fn default_queue_degraded_depth() -> usize { 5_000 }
fn default_queue_unhealthy_depth() -> usize { 10_000 }
fn default_health_report_interval_secs() -> u64 { 60 }

impl Default for TimecardConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_prefix: None,
            l1_capacity: default_l1_capacity(),
            l1_ttl_secs: default_l1_ttl_secs(),
            l2_capacity: default_l2_capacity(),
            l2_ttl_secs: default_l2_ttl_secs(),
            l2_decay_interval_secs: default_l2_decay_interval_secs(),
            promotion_threshold: default_promotion_threshold(),
            batch_flush_count: default_batch_flush_count(),
            batch_max_flush_interval_ms: default_batch_max_flush_interval_ms(),
            batch_critical_latency_ms: default_batch_critical_latency_ms(),
            batch_max_size: default_batch_max_size(),
            max_queue_size: default_max_queue_size(),
            max_write_retries: default_max_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            dead_letter_capacity: default_dead_letter_capacity(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown_ms(),
            store_call_timeout_ms: default_store_call_timeout_ms(),
            active_session_ttl_secs: default_active_session_ttl_secs(),
            archive_ttl_secs: default_archive_ttl_secs(),
            max_session_secs: default_max_session_secs(),
            history_limit: default_history_limit(),
            category_ttl_secs: default_category_ttl_secs(),
            max_categories: default_max_categories(),
            latency_window_secs: default_latency_window_secs(),
            queue_degraded_depth: default_queue_degraded_depth(),
            queue_unhealthy_depth: default_queue_unhealthy_depth(),
            health_report_interval_secs: default_health_report_interval_secs(),
        }
    }
}

impl TimecardConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 13] = [
            ("l1_capacity", self.l1_capacity as u64),
            ("l1_ttl_secs", self.l1_ttl_secs),
            ("l2_capacity", self.l2_capacity as u64),
            ("l2_ttl_secs", self.l2_ttl_secs),
            ("l2_decay_interval_secs", self.l2_decay_interval_secs),
            ("batch_flush_count", self.batch_flush_count as u64),
            ("batch_max_flush_interval_ms", self.batch_max_flush_interval_ms),
            ("batch_max_size", self.batch_max_size as u64),
            ("max_queue_size", self.max_queue_size as u64),
            ("circuit_failure_threshold", self.circuit_failure_threshold as u64),
            ("store_call_timeout_ms", self.store_call_timeout_ms),
            ("max_session_secs", self.max_session_secs),
            ("latency_window_secs", self.latency_window_secs),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        if self.queue_degraded_depth > self.queue_unhealthy_depth {
            return Err(ConfigError::Inconsistent(format!(
                "queue_degraded_depth ({}) exceeds queue_unhealthy_depth ({})",
                self.queue_degraded_depth, self.queue_unhealthy_depth
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn circuit(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            cooldown: Duration::from_millis(self.circuit_cooldown_ms),
            call_timeout: Duration::from_millis(self.store_call_timeout_ms),
        }
    }

    /// Requeue schedule for failed batch writes
    #[must_use]
    pub fn write_retry(&self) -> RetryConfig {
        RetryConfig::write_behind(
            Duration::from_millis(self.retry_backoff_ms),
            Duration::from_millis(self.max_retry_delay_ms),
            self.max_write_retries as usize,
        )
    }

    #[must_use]
    pub fn active_session_ttl(&self) -> Duration {
        Duration::from_secs(self.active_session_ttl_secs)
    }

    #[must_use]
    pub fn archive_ttl(&self) -> Duration {
        Duration::from_secs(self.archive_ttl_secs)
    }

    #[must_use]
    pub fn category_ttl(&self) -> Duration {
        Duration::from_secs(self.category_ttl_secs)
    }
}
