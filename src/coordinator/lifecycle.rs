// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: construction, background tasks, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EngineState, TimecardEngine};
use crate::batching::{BatchProcessor, BatchQueue, QueueConfig, ShutdownReport};
use crate::cache::{CacheConfig, CacheHierarchy};
use crate::category::CategoryRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::TimecardConfig;
use crate::error::{EngineError, Result};
use crate::health::{HealthMonitor, HealthThresholds, LatencyTracker};
use crate::resilience::CircuitBreaker;
use crate::session::{SessionConfig, SessionEngine};
use crate::storage::{BackingStore, InMemoryStore};

const STORE_CIRCUIT: &str = "store";

impl TimecardEngine {
    /// Build every component around `store` and start background work.
    ///
    /// Startup order:
    /// 1. Circuit breaker around the store
    /// 2. Write queue
    /// 3. Cache hierarchy (producer side of the queue)
    /// 4. Batch processor with the cache as its persistence observer
    /// 5. Category registry, session engine, health monitor
    /// 6. Maintenance and health reporter tasks
    pub async fn start(config: TimecardConfig, store: Arc<dyn BackingStore>) -> Result<Self> {
        Self::start_with_clock(config, store, Arc::new(SystemClock)).await
    }

    /// [`start`](Self::start) with an explicit session clock.
    #[tracing::instrument(skip_all)]
    pub async fn start_with_clock(
        config: TimecardConfig,
        store: Arc<dyn BackingStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let startup_start = Instant::now();
        config.validate()?;
        info!("Starting timecard engine...");

        // ========== PHASE 1: Breaker + write queue ==========
        let breaker = Arc::new(CircuitBreaker::new(STORE_CIRCUIT, config.circuit()));
        let queue = Arc::new(BatchQueue::new(QueueConfig::from_engine(&config)));

        // ========== PHASE 2: Cache hierarchy ==========
        let cache = Arc::new(CacheHierarchy::new(
            CacheConfig::from_engine(&config),
            store.clone(),
            breaker.clone(),
            queue.clone(),
        ));

        // ========== PHASE 3: Drain loop ==========
        let processor = BatchProcessor::new(queue.clone(), store.clone(), breaker.clone(), config.write_retry())
            .with_observer(cache.clone())
            .spawn();

        // ========== PHASE 4: Domain components ==========
        let latency = Arc::new(LatencyTracker::new(Duration::from_secs(config.latency_window_secs)));
        let categories = Arc::new(CategoryRegistry::new(cache.clone(), &config));
        let sessions = Arc::new(SessionEngine::new(
            SessionConfig::from_engine(&config),
            cache.clone(),
            categories.clone(),
            clock,
            latency.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            cache.clone(),
            queue.clone(),
            breaker.clone(),
            latency.clone(),
            HealthThresholds::from_engine(&config),
        ));

        // ========== PHASE 5: Background tasks ==========
        let (stop, stop_rx) = watch::channel(false);
        let mut background = vec![spawn_maintenance(
            cache.clone(),
            sessions.clone(),
            Duration::from_secs(config.l2_decay_interval_secs),
            stop_rx.clone(),
        )];
        if config.health_report_interval_secs > 0 {
            background.push(
                health
                    .clone()
                    .spawn_reporter(Duration::from_secs(config.health_report_interval_secs), stop_rx),
            );
        }

        let (state, state_rx) = watch::channel(EngineState::Running);
        let engine = Self {
            config,
            state,
            state_rx,
            stop,
            background: Mutex::new(background),
            store,
            breaker,
            queue,
            processor,
            cache,
            sessions,
            categories,
            health,
            latency,
        };
        engine.set_state(EngineState::Running);
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "Timecard engine running");
        Ok(engine)
    }

    /// Connect to the configured Redis, or fall back to an in-process store.
    pub async fn connect(config: TimecardConfig) -> Result<Self> {
        let store: Arc<dyn BackingStore> = match &config.redis_url {
            Some(url) => {
                info!(prefix = ?config.redis_prefix, "Connecting to Redis backing store...");
                let store = crate::storage::redis::RedisStore::with_prefix(url, config.redis_prefix.as_deref())
                    .await
                    .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
                Arc::new(store)
            }
            None => {
                warn!("No Redis URL configured, sessions will not survive a restart");
                Arc::new(InMemoryStore::new())
            }
        };
        Self::start(config, store).await
    }

    /// Flush everything that is ready right now and wait for it.
    pub async fn flush(&self) -> Result<crate::batching::FlushOutcome> {
        self.processor.flush_now().await
    }

    /// Stop background tasks, drain the write queue once and stop.
    ///
    /// Writes still failing in the final drain are returned rather than
    /// retried. Calling this again after the engine stopped returns an
    /// empty report.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.state() != EngineState::Running {
            debug!(state = %self.state(), "Shutdown already done or in progress");
            return ShutdownReport::default();
        }
        info!("Shutting down timecard engine...");
        self.set_state(EngineState::Draining);

        let _ = self.stop.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let report = self.processor.shutdown().await;
        self.set_state(EngineState::Stopped);
        if report.unpersisted.is_empty() {
            info!(persisted = report.persisted, "Timecard engine stopped");
        } else {
            warn!(
                persisted = report.persisted,
                unpersisted = report.unpersisted.len(),
                "Timecard engine stopped with unpersisted writes"
            );
        }
        report
    }
}

/// Cache housekeeping and lock pruning on a fixed period.
fn spawn_maintenance(
    cache: Arc<CacheHierarchy>,
    sessions: Arc<SessionEngine>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = cache.purge_expired();
                    cache.decay();
                    let pruned = sessions.locks().prune();
                    debug!(purged, pruned_locks = pruned, "Maintenance pass");
                }
                _ = stop.changed() => break,
            }
        }
    })
}
