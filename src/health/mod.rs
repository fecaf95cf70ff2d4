// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Point-in-time health view over every component.
//!
//! Everything read here is an atomic counter or a lock-free histogram, so
//! taking a snapshot never contends with session operations.
//!
//! # Status rules
//!
//! | Condition | Status |
//! |-----------|--------|
//! | circuit open | unhealthy |
//! | queue depth above the unhealthy threshold | unhealthy |
//! | circuit half-open | degraded |
//! | queue depth above the degraded threshold | degraded |
//! | hit rate below 70% after at least 100 lookups | degraded |
//! | any permanently failed write | degraded |

pub mod latency;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use latency::{LatencySummary, LatencyTracker};

use crate::backpressure::BackpressureLevel;
use crate::batching::{BatchQueue, QueueStats};
use crate::cache::{CacheHierarchy, CacheStatsSnapshot, Tier};
use crate::config::TimecardConfig;
use crate::resilience::{CircuitBreaker, CircuitSnapshot, CircuitState};

const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 100;
const MIN_HIT_RATE: f64 = 0.70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy = 0,
    Degraded = 1,
    Unhealthy = 2,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    /// Why the status is not healthy
    pub reasons: Vec<String>,
    pub cache: CacheStatsSnapshot,
    pub queue: QueueStats,
    pub circuit: CircuitSnapshot,
    pub latency: LatencySummary,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub queue_degraded_depth: usize,
    pub queue_unhealthy_depth: usize,
}

impl HealthThresholds {
    pub fn from_engine(config: &TimecardConfig) -> Self {
        Self {
            queue_degraded_depth: config.queue_degraded_depth,
            queue_unhealthy_depth: config.queue_unhealthy_depth,
        }
    }
}

pub struct HealthMonitor {
    cache: Arc<CacheHierarchy>,
    queue: Arc<BatchQueue>,
    breaker: Arc<CircuitBreaker>,
    latency: Arc<LatencyTracker>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(
        cache: Arc<CacheHierarchy>,
        queue: Arc<BatchQueue>,
        breaker: Arc<CircuitBreaker>,
        latency: Arc<LatencyTracker>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            cache,
            queue,
            breaker,
            latency,
            thresholds,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let cache = self.cache.stats();
        let queue = self.queue.stats();
        let circuit = self.breaker.snapshot();
        let latency = self.latency.summary();
        let (status, reasons) = assess(&self.thresholds, &cache, &queue, &circuit);
        HealthSnapshot {
            status,
            reasons,
            cache,
            queue,
            circuit,
            latency,
        }
    }

    /// Push the snapshot into the metrics gauges.
    pub fn publish(&self, snapshot: &HealthSnapshot) {
        crate::metrics::set_health_status(snapshot.status as u8);
        crate::metrics::set_cache_items(Tier::L1.as_str(), snapshot.cache.l1.size);
        crate::metrics::set_cache_items(Tier::L2.as_str(), snapshot.cache.l2.size);
        crate::metrics::set_cache_hit_rate(snapshot.cache.hit_rate);
        crate::metrics::set_backpressure_level(snapshot.queue.backpressure as u8);
        crate::metrics::set_circuit_state(&snapshot.circuit.name, snapshot.circuit.state as u8);
        crate::metrics::set_latency_percentile("p50", snapshot.latency.p50_ms / 1000.0);
        crate::metrics::set_latency_percentile("p95", snapshot.latency.p95_ms / 1000.0);
        crate::metrics::set_latency_percentile("p99", snapshot.latency.p99_ms / 1000.0);
    }

    /// Log and publish a snapshot every `period` until `shutdown` flips.
    pub fn spawn_reporter(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = self.snapshot();
                        self.publish(&snapshot);
                        match snapshot.status {
                            HealthStatus::Healthy => info!(
                                queue_depth = snapshot.queue.depth,
                                hit_rate = snapshot.cache.hit_rate,
                                p99_ms = snapshot.latency.p99_ms,
                                "Health report"
                            ),
                            status => warn!(
                                %status,
                                reasons = ?snapshot.reasons,
                                queue_depth = snapshot.queue.depth,
                                circuit = %snapshot.circuit.state,
                                "Health report"
                            ),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

fn assess(
    thresholds: &HealthThresholds,
    cache: &CacheStatsSnapshot,
    queue: &QueueStats,
    circuit: &CircuitSnapshot,
) -> (HealthStatus, Vec<String>) {
    let mut status = HealthStatus::Healthy;
    let mut reasons = Vec::new();
    let mut flag = |level: HealthStatus, reason: String| {
        status = status.max(level);
        reasons.push(reason);
    };

    match circuit.state {
        CircuitState::Open => flag(HealthStatus::Unhealthy, "circuit open".to_string()),
        CircuitState::HalfOpen => flag(HealthStatus::Degraded, "circuit half-open".to_string()),
        CircuitState::Closed => {}
    }

    if queue.depth > thresholds.queue_unhealthy_depth {
        flag(HealthStatus::Unhealthy, format!("write queue depth {}", queue.depth));
    } else if queue.depth > thresholds.queue_degraded_depth {
        flag(HealthStatus::Degraded, format!("write queue depth {}", queue.depth));
    }
    if queue.backpressure >= BackpressureLevel::High {
        flag(HealthStatus::Degraded, queue.backpressure.description().to_string());
    }

    if cache.lookups >= MIN_LOOKUPS_FOR_HIT_RATE && cache.hit_rate < MIN_HIT_RATE {
        flag(
            HealthStatus::Degraded,
            format!("cache hit rate {:.1}%", cache.hit_rate * 100.0),
        );
    }

    if queue.permanent_failures > 0 {
        flag(
            HealthStatus::Degraded,
            format!("{} writes permanently failed", queue.permanent_failures),
        );
    }

    (status, reasons)
}
