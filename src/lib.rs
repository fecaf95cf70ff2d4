// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Timecard Engine
//!
//! Reliability core for chat-platform time tracking: one open work session
//! per (user, server), kept fast by a tiered cache and durable by a
//! prioritized write-behind queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Session Engine                         │
//! │  • clock_in / clock_out / force_clock_out / heartbeat      │
//! │  • Per-(user, server) async locks                          │
//! │  • Category rules via the CategoryRegistry                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Cache Hierarchy                         │
//! │  • L1: LRU, short TTL, hot session slots                   │
//! │  • L2: LFU with periodic decay, archives and history       │
//! │  • Dirty entries pinned until the store acknowledges them │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (write-behind via the priority BatchQueue)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Batch Processor                        │
//! │  • Critical / Normal / Background lanes                    │
//! │  • Per-key coalescing, bounded retries, dead letters       │
//! │  • Load shedding by backpressure level                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (through the CircuitBreaker)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 L3: Backing Store (Redis)                   │
//! │  • System of record, pipelined batch writes                │
//! │  • In-memory store for tests and single-process runs       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use timecard_engine::{TimecardConfig, TimecardEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TimecardConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         ..Default::default()
//!     };
//!     let engine = TimecardEngine::connect(config).await.expect("Failed to start");
//!
//!     let session = engine.clock_in(42, 7, "work").await.expect("clock in");
//!     println!("Clocked in: {}", session.session_id);
//!
//!     let archived = engine.clock_out(42, 7).await.expect("clock out");
//!     println!("Worked {}s", archived.accumulated_seconds);
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`TimecardEngine`] owning every component
//! - [`session`]: Session state machine, history and totals
//! - [`category`]: Per-server category configuration
//! - [`cache`]: L1/L2 tiers over the backing store
//! - [`batching`]: Priority write queue and drain loop
//! - [`resilience`]: Circuit breaker and retry backoff
//! - [`storage`]: Backing stores (Redis, memory)
//! - [`health`]: Health snapshots and latency percentiles
//! - [`backpressure`]: Queue-depth load shedding

pub mod backpressure;
pub mod batching;
pub mod cache;
pub mod category;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod metrics;
pub mod resilience;
pub mod session;
pub mod storage;

pub use backpressure::BackpressureLevel;
pub use batching::{FlushOutcome, Priority, ShutdownReport};
pub use cache::{CacheStatsSnapshot, Tier};
pub use category::{Category, CategoryConfig, CategoryRemoval, NewCategory};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, TimecardConfig};
pub use coordinator::{EngineState, TimecardEngine};
pub use error::{EngineError, Result, ValidationError};
pub use health::{HealthSnapshot, HealthStatus, LatencySummary};
pub use metrics::LatencyTimer;
pub use resilience::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState, RetryConfig};
pub use session::{
    ArchivedSession, CategoryTotal, CloseReason, ServerId, ServerTotals, Session, SessionHistory, SessionState, UserId,
    UserTotals,
};
pub use storage::{BackingStore, InMemoryStore, StorageError};
