// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for timecard-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `timecard_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: L1, L2, L3
//! - `operation`: clock_in, clock_out, force_clock_out, get_status, ...
//! - `status`: success, error, rejected
//! - `priority`: critical, normal, background
//! - `circuit`: breaker name

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

// ═══════════════════════════════════════════════════════════════════════════
// SESSION OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a session engine operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "timecard_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "timecard_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the tracked length of a closed session
pub fn record_session_duration(seconds: u64, capped: bool) {
    histogram!("timecard_session_duration_seconds").record(seconds as f64);
    if capped {
        counter!("timecard_sessions_capped_total").increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE TIERS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup at one tier ("hit" / "miss")
pub fn record_cache_lookup(tier: &str, outcome: &'static str) {
    counter!(
        "timecard_cache_lookups_total",
        "tier" => tier.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record an entry leaving a tier ("demoted", "dropped", "expired")
pub fn record_cache_eviction(tier: &str, action: &'static str) {
    counter!(
        "timecard_cache_evictions_total",
        "tier" => tier.to_string(),
        "action" => action
    )
    .increment(1);
}

/// Record promotion of an entry into a faster tier
pub fn record_cache_promotion(from_tier: &str) {
    counter!(
        "timecard_cache_promotions_total",
        "from" => from_tier.to_string()
    )
    .increment(1);
}

/// Set current item count of a tier
pub fn set_cache_items(tier: &str, count: usize) {
    gauge!(
        "timecard_cache_items",
        "tier" => tier.to_string()
    )
    .set(count as f64);
}

/// Set rolling cache hit rate (0.0 - 1.0)
pub fn set_cache_hit_rate(rate: f64) {
    gauge!("timecard_cache_hit_rate").set(rate);
}

// ═══════════════════════════════════════════════════════════════════════════
// BATCH WRITE PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════

/// Record an operation accepted into the write queue
pub fn record_enqueued(priority: &str) {
    counter!(
        "timecard_batch_enqueued_total",
        "priority" => priority.to_string()
    )
    .increment(1);
}

/// Record writes rejected because the queue was full
pub fn record_overload_rejection() {
    counter!("timecard_batch_rejected_total").increment(1);
}

/// Record operations folded into a later write to the same key
pub fn record_coalesced(count: usize) {
    counter!("timecard_batch_coalesced_total").increment(count as u64);
}

/// Record one flush attempt
pub fn record_flush(reason: &str, size: usize, status: &str, duration: Duration) {
    counter!(
        "timecard_batch_flushes_total",
        "reason" => reason.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("timecard_batch_size").record(size as f64);
    histogram!("timecard_batch_flush_seconds").record(duration.as_secs_f64());
}

/// Record operations put back on the queue after a failed flush
pub fn record_requeued(count: usize) {
    counter!("timecard_batch_requeued_total").increment(count as u64);
}

/// Record operations that exhausted their retries
pub fn record_permanent_failures(count: usize) {
    counter!("timecard_batch_permanent_failures_total").increment(count as u64);
}

/// Set queue depth for one priority class
pub fn set_queue_depth(priority: &str, depth: usize) {
    gauge!(
        "timecard_batch_queue_depth",
        "priority" => priority.to_string()
    )
    .set(depth as f64);
}

/// Set backpressure level (0 = Normal .. 5 = Shutdown)
pub fn set_backpressure_level(level: u8) {
    gauge!("timecard_backpressure_level").set(level as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "timecard_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "timecard_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a persisted record that failed to decode
pub fn record_corruption() {
    counter!("timecard_corruption_detected_total").increment(1);
}

/// Track engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "timecard_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set overall health (0 = healthy, 1 = degraded, 2 = unhealthy)
pub fn set_health_status(status: u8) {
    gauge!("timecard_health_status").set(status as f64);
}

/// Set a latency percentile gauge from the rolling window
pub fn set_latency_percentile(quantile: &'static str, seconds: f64) {
    gauge!(
        "timecard_latency_seconds",
        "quantile" => quantile
    )
    .set(seconds);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
