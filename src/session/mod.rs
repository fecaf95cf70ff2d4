// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Clock-in / clock-out state machine.
//!
//! ```text
//!   Idle ──clock_in──> Active ──clock_out / force_clock_out──> PendingClose ──> Archived
//! ```
//!
//! Each (user, server) pair has one slot key. Clock-in and close hold the
//! pair's lock across their read-check-write, so two concurrent clock-ins
//! for one pair yield exactly one session.
//!
//! Closing marks the slot `PendingClose`, then enqueues the archived record,
//! the `Idle` slot and the server-wide totals together. The live record only
//! leaves the cache once its archive is in the write queue. If the queue
//! refuses, the slot goes back to `Active` and the caller sees the error.
//!
//! Manually entered time skips the slot entirely: the archived record and
//! every total it touches are accepted together or not at all.

pub mod history;
pub mod keys;
pub mod locks;
pub mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

pub use history::SessionHistory;
pub use locks::SessionLocks;
pub use types::{
    ArchivedSession, CategoryTotal, CloseReason, ServerId, ServerTotals, Session, SessionState, UserId, UserTotals,
};

use crate::batching::Priority;
use crate::cache::{self, CacheHierarchy, WriteOptions};
use crate::category::CategoryRegistry;
use crate::clock::Clock;
use crate::config::TimecardConfig;
use crate::error::{EngineError, Result, ValidationError};
use crate::health::latency::LatencyTracker;

const SESSION_ORIGIN: &str = "session";
const ARCHIVE_ORIGIN: &str = "archive";
const HISTORY_ORIGIN: &str = "history";

type Write = (String, Arc<[u8]>, WriteOptions);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub active_ttl: Duration,
    pub archive_ttl: Duration,
    pub max_session_secs: u64,
    pub history_limit: usize,
}

impl SessionConfig {
    pub fn from_engine(config: &TimecardConfig) -> Self {
        Self {
            active_ttl: config.active_session_ttl(),
            archive_ttl: config.archive_ttl(),
            max_session_secs: config.max_session_secs,
            history_limit: config.history_limit,
        }
    }
}

pub struct SessionEngine {
    config: SessionConfig,
    cache: Arc<CacheHierarchy>,
    categories: Arc<CategoryRegistry>,
    clock: Arc<dyn Clock>,
    locks: SessionLocks,
    latency: Arc<LatencyTracker>,
}

impl SessionEngine {
    pub fn new(
        config: SessionConfig,
        cache: Arc<CacheHierarchy>,
        categories: Arc<CategoryRegistry>,
        clock: Arc<dyn Clock>,
        latency: Arc<LatencyTracker>,
    ) -> Self {
        Self {
            config,
            cache,
            categories,
            clock,
            locks: SessionLocks::new(),
            latency,
        }
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    fn slot_write(&self) -> WriteOptions {
        WriteOptions::hot(Priority::Critical, SESSION_ORIGIN).with_ttl(self.config.active_ttl)
    }

    fn history_options(&self) -> WriteOptions {
        WriteOptions::warm(Priority::Normal, HISTORY_ORIGIN).with_ttl(self.config.archive_ttl)
    }

    fn archive_write(&self, archived: &ArchivedSession) -> Result<Write> {
        let key = keys::archive(archived.server_id, archived.user_id, archived.session_id);
        let bytes = cache::encode(&key, archived)?;
        let options = WriteOptions::warm(Priority::Critical, ARCHIVE_ORIGIN).with_ttl(self.config.archive_ttl);
        Ok((key, bytes, options))
    }

    /// Server totals with `archived` added. Caller holds the server lock.
    async fn server_totals_write(&self, archived: &ArchivedSession) -> Result<Write> {
        let key = keys::server_totals(archived.server_id);
        let mut totals = self
            .cache
            .get_json::<ServerTotals>(&key)
            .await?
            .unwrap_or_else(|| ServerTotals::new(archived.server_id));
        totals.add(archived);
        let bytes = cache::encode(&key, &totals)?;
        Ok((key, bytes, self.history_options()))
    }

    /// User totals and recent history with `archived` added. Caller holds the pair lock.
    async fn history_writes(&self, archived: &ArchivedSession) -> Result<[Write; 2]> {
        let (user_id, server_id) = (archived.user_id, archived.server_id);
        let totals_key = keys::totals(server_id, user_id);
        let history_key = keys::history(server_id, user_id);

        let mut totals = self
            .cache
            .get_json::<UserTotals>(&totals_key)
            .await?
            .unwrap_or_else(|| UserTotals::new(user_id, server_id));
        totals.add(archived);
        let mut recent = self
            .cache
            .get_json::<Vec<ArchivedSession>>(&history_key)
            .await?
            .unwrap_or_default();
        history::push_recent(&mut recent, archived.clone(), self.config.history_limit);

        let totals = cache::encode(&totals_key, &totals)?;
        let recent = cache::encode(&history_key, &recent)?;
        Ok([
            (totals_key, totals, self.history_options()),
            (history_key, recent, self.history_options()),
        ])
    }

    fn finish<T>(&self, operation: &'static str, started: Instant, result: &Result<T>) {
        let elapsed = started.elapsed();
        self.latency.record(elapsed);
        crate::metrics::record_latency(operation, elapsed);
        let status = match result {
            Ok(_) => "success",
            Err(e) if e.is_conflict() => "conflict",
            Err(EngineError::Validation(_)) => "invalid",
            Err(_) => "error",
        };
        crate::metrics::record_operation(operation, status);
    }

    /// Current slot contents. `None` when the slot was never written.
    async fn load_slot(&self, user_id: UserId, server_id: ServerId) -> Result<Option<Session>> {
        self.cache.get_json::<Session>(&keys::active(server_id, user_id)).await
    }

    /// Start a session.
    ///
    /// Fails with `UnknownCategory` for unconfigured or archived categories
    /// and `AlreadyActive` if the pair already has an open session. When the
    /// slot is not cached and the store is unreachable the outcome cannot be
    /// decided and `StoreUnavailable` is returned.
    #[tracing::instrument(skip(self))]
    pub async fn clock_in(&self, user_id: UserId, server_id: ServerId, category: &str) -> Result<Session> {
        let started = Instant::now();
        let result = self.clock_in_inner(user_id, server_id, category).await;
        self.finish("clock_in", started, &result);
        result
    }

    async fn clock_in_inner(&self, user_id: UserId, server_id: ServerId, category: &str) -> Result<Session> {
        let category = self.categories.require_active(server_id, category).await?;
        let _guard = self.locks.lock(user_id, server_id).await;

        if let Some(current) = self.load_slot(user_id, server_id).await? {
            if current.state.is_open() {
                return Err(EngineError::AlreadyActive { user_id, server_id });
            }
        }

        let session = Session::start(user_id, server_id, category.name, self.clock.now_millis());
        self.cache
            .put_json(&keys::active(server_id, user_id), &session, self.slot_write())?;
        info!(user_id, server_id, category = %session.category, session_id = %session.session_id, "Clocked in");
        Ok(session)
    }

    #[tracing::instrument(skip(self))]
    pub async fn clock_out(&self, user_id: UserId, server_id: ServerId) -> Result<ArchivedSession> {
        let started = Instant::now();
        let result = self.close(user_id, server_id, CloseReason::User).await;
        self.finish("clock_out", started, &result);
        result
    }

    /// Close another user's session. The caller has already checked the
    /// admin's permissions; the admin is recorded on the archived record.
    #[tracing::instrument(skip(self))]
    pub async fn force_clock_out(
        &self,
        admin_id: UserId,
        user_id: UserId,
        server_id: ServerId,
    ) -> Result<ArchivedSession> {
        let started = Instant::now();
        let result = self.close(user_id, server_id, CloseReason::Admin { admin_id }).await;
        self.finish("force_clock_out", started, &result);
        result
    }

    async fn close(&self, user_id: UserId, server_id: ServerId, reason: CloseReason) -> Result<ArchivedSession> {
        let _guard = self.locks.lock(user_id, server_id).await;
        let slot_key = keys::active(server_id, user_id);

        let session = match self.load_slot(user_id, server_id).await? {
            Some(session) if session.state.is_open() => session,
            _ => return Err(EngineError::NoActiveSession { user_id, server_id }),
        };

        // ========== PendingClose ==========
        let mut pending = session.clone();
        pending.state = SessionState::PendingClose;
        self.cache.put_json(&slot_key, &pending, self.slot_write())?;

        // ========== Archive + Idle slot + server totals, accepted together ==========
        let archived = ArchivedSession::close(&session, self.clock.now_millis(), self.config.max_session_secs, reason);
        let mut writes = vec![
            self.archive_write(&archived)?,
            (
                slot_key.clone(),
                cache::encode(&slot_key, &Session::idle(user_id, server_id))?,
                self.slot_write(),
            ),
        ];
        let _server_guard = self.locks.lock_server(server_id).await;
        match self.server_totals_write(&archived).await {
            Ok(write) => writes.push(write),
            // Unreadable totals are skipped; the close still goes through
            Err(e) => warn!(server_id, error = %e, "Server totals not updated for this close"),
        }
        if let Err(e) = self.cache.put_many(writes) {
            let mut restored = session.clone();
            restored.state = SessionState::Active;
            if let Err(restore_err) = self.cache.put_json(&slot_key, &restored, self.slot_write()) {
                // Slot stays PendingClose, which still counts as open, so the close can be retried
                warn!(user_id, server_id, error = %restore_err, "Could not restore session after failed close");
            }
            warn!(user_id, server_id, error = %e, "Session close not accepted, session left active");
            return Err(e);
        }

        crate::metrics::record_session_duration(archived.accumulated_seconds, archived.capped);
        if archived.capped {
            warn!(
                user_id,
                server_id,
                max_secs = self.config.max_session_secs,
                "Session exceeded maximum duration, capped"
            );
        }
        info!(
            user_id,
            server_id,
            session_id = %archived.session_id,
            seconds = archived.accumulated_seconds,
            closed_by = ?archived.closed_by,
            "Clocked out"
        );

        self.record_history(&archived).await;
        Ok(archived)
    }

    /// Best-effort bookkeeping. Failures are logged and never fail the close.
    async fn record_history(&self, archived: &ArchivedSession) {
        let (user_id, server_id) = (archived.user_id, archived.server_id);
        let writes = match self.history_writes(archived).await {
            Ok(writes) => writes,
            Err(e) => {
                warn!(user_id, server_id, error = %e, "Skipping history update");
                return;
            }
        };
        if let Err(e) = self.cache.put_many(writes.into()) {
            warn!(user_id, server_id, error = %e, "History update not accepted");
        }
    }

    /// Record a block of time without clocking in.
    ///
    /// `seconds` must be positive and at most the session cap. The category
    /// must exist and not be archived. An open session for the pair is left
    /// alone.
    #[tracing::instrument(skip(self))]
    pub async fn add_time(
        &self,
        user_id: UserId,
        server_id: ServerId,
        category: &str,
        seconds: u64,
    ) -> Result<ArchivedSession> {
        let started = Instant::now();
        let result = self.add_time_inner(user_id, server_id, category, seconds).await;
        self.finish("add_time", started, &result);
        result
    }

    async fn add_time_inner(
        &self,
        user_id: UserId,
        server_id: ServerId,
        category: &str,
        seconds: u64,
    ) -> Result<ArchivedSession> {
        let max = self.config.max_session_secs;
        if seconds == 0 || seconds > max {
            return Err(ValidationError::InvalidDuration { seconds, max }.into());
        }
        let category = self.categories.require_active(server_id, category).await?;
        let _guard = self.locks.lock(user_id, server_id).await;
        let _server_guard = self.locks.lock_server(server_id).await;

        let entry = ArchivedSession::manual(user_id, server_id, category.name, seconds, self.clock.now_millis());
        let mut writes = vec![self.archive_write(&entry)?, self.server_totals_write(&entry).await?];
        writes.extend(self.history_writes(&entry).await?);
        self.cache.put_many(writes)?;

        info!(user_id, server_id, category = %entry.category, seconds, "Time added manually");
        Ok(entry)
    }

    /// The pair's open session, if any. Reads never wait on the write queue.
    #[tracing::instrument(skip(self))]
    pub async fn get_status(&self, user_id: UserId, server_id: ServerId) -> Result<Option<Session>> {
        let started = Instant::now();
        let result = self
            .load_slot(user_id, server_id)
            .await
            .map(|slot| slot.filter(|session| session.state.is_open()));
        self.finish("get_status", started, &result);
        result
    }

    /// Push out the store-side expiry of an open session.
    ///
    /// Returns `false` when the refresh was shed under backpressure.
    #[tracing::instrument(skip(self))]
    pub async fn heartbeat(&self, user_id: UserId, server_id: ServerId) -> Result<bool> {
        let started = Instant::now();
        let result = self.heartbeat_inner(user_id, server_id).await;
        self.finish("heartbeat", started, &result);
        result
    }

    async fn heartbeat_inner(&self, user_id: UserId, server_id: ServerId) -> Result<bool> {
        match self.load_slot(user_id, server_id).await? {
            Some(session) if session.state.is_open() => {}
            _ => return Err(EngineError::NoActiveSession { user_id, server_id }),
        }
        let key = keys::active(server_id, user_id);
        match self
            .cache
            .refresh_ttl(&key, self.config.active_ttl, Priority::Background, SESSION_ORIGIN)
        {
            Ok(()) => Ok(true),
            Err(EngineError::Overloaded { depth, .. }) => {
                debug!(user_id, server_id, depth, "Heartbeat shed under backpressure");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Look up one archived session.
    pub async fn archived_session(
        &self,
        user_id: UserId,
        server_id: ServerId,
        session_id: uuid::Uuid,
    ) -> Result<Option<ArchivedSession>> {
        self.cache
            .get_json(&keys::archive(server_id, user_id, session_id))
            .await
    }
}

#[async_trait]
impl SessionHistory for SessionEngine {
    async fn recent_sessions(&self, user_id: UserId, server_id: ServerId) -> Result<Vec<ArchivedSession>> {
        Ok(self
            .cache
            .get_json(&keys::history(server_id, user_id))
            .await?
            .unwrap_or_default())
    }

    async fn user_totals(&self, user_id: UserId, server_id: ServerId) -> Result<UserTotals> {
        Ok(self
            .cache
            .get_json(&keys::totals(server_id, user_id))
            .await?
            .unwrap_or_else(|| UserTotals::new(user_id, server_id)))
    }

    async fn server_totals(&self, server_id: ServerId) -> Result<ServerTotals> {
        Ok(self
            .cache
            .get_json(&keys::server_totals(server_id))
            .await?
            .unwrap_or_else(|| ServerTotals::new(server_id)))
    }
}
