// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timecard engine coordinator.
//!
//! The [`TimecardEngine`] is the explicitly constructed context that owns
//! every component and hands shared references to each at startup:
//! - circuit breaker around the backing store
//! - write queue and its drain loop
//! - cache hierarchy (acknowledged by the drain loop on persistence)
//! - session engine, category registry, health monitor
//!
//! # Lifecycle
//!
//! ```text
//! start() → Running → shutdown() → Draining → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use timecard_engine::{EngineState, InMemoryStore, TimecardConfig, TimecardEngine};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let engine = TimecardEngine::start(TimecardConfig::default(), Arc::new(InMemoryStore::new()))
//!     .await
//!     .expect("start failed");
//! assert_eq!(engine.state(), EngineState::Running);
//!
//! let session = engine.clock_in(1, 100, "work").await.expect("clock in");
//! assert!(engine.get_status(1, 100).await.unwrap().is_some());
//! # let _ = session;
//!
//! let report = engine.shutdown().await;
//! assert!(report.unpersisted.is_empty());
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::EngineState;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::batching::{BatchQueue, ProcessorHandle};
use crate::cache::CacheHierarchy;
use crate::category::CategoryRegistry;
use crate::config::TimecardConfig;
use crate::error::EngineError;
use crate::health::{HealthMonitor, LatencyTracker};
use crate::resilience::CircuitBreaker;
use crate::session::SessionEngine;
use crate::storage::BackingStore;

/// Main timecard engine.
///
/// `Send + Sync`; share it behind an `Arc` across request handlers.
pub struct TimecardEngine {
    pub(super) config: TimecardConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Tells background tasks to stop
    pub(super) stop: watch::Sender<bool>,
    pub(super) background: Mutex<Vec<JoinHandle<()>>>,

    pub(super) store: Arc<dyn BackingStore>,
    pub(super) breaker: Arc<CircuitBreaker>,
    pub(super) queue: Arc<BatchQueue>,
    pub(super) processor: ProcessorHandle,
    pub(super) cache: Arc<CacheHierarchy>,
    pub(super) sessions: Arc<SessionEngine>,
    pub(super) categories: Arc<CategoryRegistry>,
    pub(super) health: Arc<HealthMonitor>,
    pub(super) latency: Arc<LatencyTracker>,
}

impl TimecardEngine {
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub(super) fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::ShuttingDown)
        }
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    pub fn config(&self) -> &TimecardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheHierarchy> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<BatchQueue> {
        &self.queue
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn sessions(&self) -> &Arc<SessionEngine> {
        &self.sessions
    }

    pub fn categories(&self) -> &Arc<CategoryRegistry> {
        &self.categories
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn latency(&self) -> &Arc<LatencyTracker> {
        &self.latency
    }
}

impl std::fmt::Debug for TimecardEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimecardEngine")
            .field("state", &self.state())
            .field("queue_depth", &self.queue.depth())
            .field("circuit", &self.breaker.state())
            .finish_non_exhaustive()
    }
}
