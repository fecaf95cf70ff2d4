// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store key layout for session records.

use uuid::Uuid;

use super::types::{ServerId, UserId};

/// The live (user, server) slot.
pub fn active(server_id: ServerId, user_id: UserId) -> String {
    format!("session:{}:{}", server_id, user_id)
}

pub fn archive(server_id: ServerId, user_id: UserId, session_id: Uuid) -> String {
    format!("session:archive:{}:{}:{}", server_id, user_id, session_id)
}

pub fn totals(server_id: ServerId, user_id: UserId) -> String {
    format!("totals:{}:{}", server_id, user_id)
}

/// Server-wide totals across every user.
pub fn server_totals(server_id: ServerId) -> String {
    format!("server_times:{}", server_id)
}

pub fn history(server_id: ServerId, user_id: UserId) -> String {
    format!("history:{}:{}", server_id, user_id)
}
