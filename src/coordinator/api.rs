// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing operations.
//!
//! Writes are refused with `ShuttingDown` once shutdown has begun. Reads keep
//! working until the engine is dropped.

use super::TimecardEngine;
use crate::category::{Category, CategoryConfig, CategoryRemoval, NewCategory};
use crate::error::Result;
use crate::health::HealthSnapshot;
use crate::session::{ArchivedSession, ServerId, ServerTotals, Session, SessionHistory, UserId, UserTotals};

impl TimecardEngine {
    pub async fn clock_in(&self, user_id: UserId, server_id: ServerId, category: &str) -> Result<Session> {
        self.ensure_running()?;
        self.sessions.clock_in(user_id, server_id, category).await
    }

    pub async fn clock_out(&self, user_id: UserId, server_id: ServerId) -> Result<ArchivedSession> {
        self.ensure_running()?;
        self.sessions.clock_out(user_id, server_id).await
    }

    pub async fn force_clock_out(
        &self,
        admin_id: UserId,
        user_id: UserId,
        server_id: ServerId,
    ) -> Result<ArchivedSession> {
        self.ensure_running()?;
        self.sessions.force_clock_out(admin_id, user_id, server_id).await
    }

    pub async fn get_status(&self, user_id: UserId, server_id: ServerId) -> Result<Option<Session>> {
        self.sessions.get_status(user_id, server_id).await
    }

    pub async fn heartbeat(&self, user_id: UserId, server_id: ServerId) -> Result<bool> {
        self.ensure_running()?;
        self.sessions.heartbeat(user_id, server_id).await
    }

    /// Record time without clocking in. See [`crate::session::SessionEngine::add_time`].
    pub async fn add_time(
        &self,
        user_id: UserId,
        server_id: ServerId,
        category: &str,
        seconds: u64,
    ) -> Result<ArchivedSession> {
        self.ensure_running()?;
        self.sessions.add_time(user_id, server_id, category, seconds).await
    }

    pub async fn recent_sessions(&self, user_id: UserId, server_id: ServerId) -> Result<Vec<ArchivedSession>> {
        self.sessions.recent_sessions(user_id, server_id).await
    }

    pub async fn user_totals(&self, user_id: UserId, server_id: ServerId) -> Result<UserTotals> {
        self.sessions.user_totals(user_id, server_id).await
    }

    pub async fn server_totals(&self, server_id: ServerId) -> Result<ServerTotals> {
        self.sessions.server_totals(server_id).await
    }

    /// The read-only history interface, for analytics consumers.
    pub fn history(&self) -> std::sync::Arc<dyn SessionHistory> {
        self.sessions.clone()
    }

    pub async fn get_category_config(&self, server_id: ServerId) -> Result<CategoryConfig> {
        self.categories.get_category_config(server_id).await
    }

    pub async fn list_categories(&self, server_id: ServerId, include_archived: bool) -> Result<Vec<Category>> {
        self.categories.list_categories(server_id, include_archived).await
    }

    pub async fn add_category(&self, server_id: ServerId, category: NewCategory) -> Result<Category> {
        self.ensure_running()?;
        self.categories.add_category(server_id, category).await
    }

    pub async fn archive_category(&self, server_id: ServerId, name: &str) -> Result<Category> {
        self.ensure_running()?;
        self.categories.archive_category(server_id, name).await
    }

    pub async fn restore_category(&self, server_id: ServerId, name: &str) -> Result<Category> {
        self.ensure_running()?;
        self.categories.restore_category(server_id, name).await
    }

    pub async fn remove_category(&self, server_id: ServerId, name: &str) -> Result<CategoryRemoval> {
        self.ensure_running()?;
        self.categories.remove_category(server_id, name).await
    }

    pub fn get_health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }
}
