// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = u64;
pub type ServerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session; the slot is vacant
    Idle,
    Active,
    /// Close in progress: the archive write is being enqueued
    PendingClose,
    /// Terminal; only archived records carry it
    Archived,
}

impl SessionState {
    /// Occupies the (user, server) slot.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Active | Self::PendingClose)
    }
}

/// The live record in a (user, server) slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub server_id: ServerId,
    pub category: String,
    /// Milliseconds since the Unix epoch
    pub start_timestamp: i64,
    pub accumulated_seconds: u64,
    pub state: SessionState,
}

impl Session {
    pub fn start(user_id: UserId, server_id: ServerId, category: impl Into<String>, now_millis: i64) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            server_id,
            category: category.into(),
            start_timestamp: now_millis,
            accumulated_seconds: 0,
            state: SessionState::Active,
        }
    }

    /// The vacant-slot marker written after a close.
    pub fn idle(user_id: UserId, server_id: ServerId) -> Self {
        Self {
            session_id: Uuid::nil(),
            user_id,
            server_id,
            category: String::new(),
            start_timestamp: 0,
            accumulated_seconds: 0,
            state: SessionState::Idle,
        }
    }

    /// Whole seconds elapsed since the session started, never negative.
    #[must_use]
    pub fn elapsed_seconds(&self, now_millis: i64) -> u64 {
        (now_millis.saturating_sub(self.start_timestamp).max(0) / 1000) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum CloseReason {
    User,
    Admin { admin_id: UserId },
    /// Entered by hand rather than clocked
    Manual,
}

/// A closed session. Never deleted by the engine; the store's TTL ages it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedSession {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub server_id: ServerId,
    pub category: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub accumulated_seconds: u64,
    /// Duration was cut to the configured maximum
    pub capped: bool,
    pub state: SessionState,
    pub closed_by: CloseReason,
}

impl ArchivedSession {
    pub(crate) fn close(session: &Session, end_timestamp: i64, max_seconds: u64, closed_by: CloseReason) -> Self {
        let total = session
            .accumulated_seconds
            .saturating_add(session.elapsed_seconds(end_timestamp));
        Self {
            session_id: session.session_id,
            user_id: session.user_id,
            server_id: session.server_id,
            category: session.category.clone(),
            start_timestamp: session.start_timestamp,
            end_timestamp,
            accumulated_seconds: total.min(max_seconds),
            capped: total > max_seconds,
            state: SessionState::Archived,
            closed_by,
        }
    }

    /// A hand-entered block of time ending at `end_timestamp`.
    pub(crate) fn manual(
        user_id: UserId,
        server_id: ServerId,
        category: impl Into<String>,
        seconds: u64,
        end_timestamp: i64,
    ) -> Self {
        let millis = i64::try_from(seconds).unwrap_or(i64::MAX).saturating_mul(1000);
        let start_timestamp = end_timestamp.saturating_sub(millis);
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            server_id,
            category: category.into(),
            start_timestamp,
            end_timestamp,
            accumulated_seconds: seconds,
            capped: false,
            state: SessionState::Archived,
            closed_by: CloseReason::Manual,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub seconds: u64,
    pub sessions: u64,
}

/// Running per-category totals for one user in one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTotals {
    pub user_id: UserId,
    pub server_id: ServerId,
    pub total_seconds: u64,
    pub sessions: u64,
    pub by_category: BTreeMap<String, CategoryTotal>,
}

impl UserTotals {
    pub fn new(user_id: UserId, server_id: ServerId) -> Self {
        Self {
            user_id,
            server_id,
            total_seconds: 0,
            sessions: 0,
            by_category: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, archived: &ArchivedSession) {
        tally(&mut self.total_seconds, &mut self.sessions, &mut self.by_category, archived);
    }
}

/// Running per-category totals across every user in one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTotals {
    pub server_id: ServerId,
    pub total_seconds: u64,
    pub sessions: u64,
    pub by_category: BTreeMap<String, CategoryTotal>,
}

impl ServerTotals {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            total_seconds: 0,
            sessions: 0,
            by_category: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, archived: &ArchivedSession) {
        tally(&mut self.total_seconds, &mut self.sessions, &mut self.by_category, archived);
    }

    /// Recorded time exists against `category`.
    #[must_use]
    pub fn has_usage(&self, category: &str) -> bool {
        self.by_category.get(category).is_some_and(|t| t.sessions > 0)
    }
}

fn tally(
    total_seconds: &mut u64,
    sessions: &mut u64,
    by_category: &mut BTreeMap<String, CategoryTotal>,
    archived: &ArchivedSession,
) {
    *total_seconds += archived.accumulated_seconds;
    *sessions += 1;
    let entry = by_category.entry(archived.category.clone()).or_default();
    entry.seconds += archived.accumulated_seconds;
    entry.sessions += 1;
}
