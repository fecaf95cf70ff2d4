// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only access to closed sessions for analytics consumers.
//!
//! Consumers only read. Nothing they do can block or fail a clock-in or
//! clock-out, and the close path treats its own history bookkeeping as best
//! effort.

use async_trait::async_trait;

use super::types::{ArchivedSession, ServerId, ServerTotals, UserId, UserTotals};
use crate::error::Result;

#[async_trait]
pub trait SessionHistory: Send + Sync {
    /// Most recent closed sessions, newest first.
    async fn recent_sessions(&self, user_id: UserId, server_id: ServerId) -> Result<Vec<ArchivedSession>>;

    /// Running totals; zeroed when the user has no history.
    async fn user_totals(&self, user_id: UserId, server_id: ServerId) -> Result<UserTotals>;

    /// Totals across every user in the server; zeroed when nothing was recorded.
    async fn server_totals(&self, server_id: ServerId) -> Result<ServerTotals>;
}

/// Put `archived` at the front and keep at most `limit` entries.
pub(crate) fn push_recent(history: &mut Vec<ArchivedSession>, archived: ArchivedSession, limit: usize) {
    history.insert(0, archived);
    history.truncate(limit);
}
