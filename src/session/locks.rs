// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-(user, server) serialization.
//!
//! Operations on different pairs never wait on each other. Server-wide
//! records take a per-server lock, always after the pair lock. Idle locks are
//! pruned by the maintenance task.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::types::{ServerId, UserId};

#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: DashMap<(UserId, ServerId), Arc<Mutex<()>>>,
    servers: DashMap<ServerId, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, user_id: UserId, server_id: ServerId) -> OwnedMutexGuard<()> {
        // Clone out of the map so no shard lock is held across the await
        let lock = self.locks.entry((user_id, server_id)).or_default().clone();
        lock.lock_owned().await
    }

    /// Serializes read-modify-write of one server's shared records.
    pub async fn lock_server(&self, server_id: ServerId) -> OwnedMutexGuard<()> {
        let lock = self.servers.entry(server_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len() + self.servers.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.servers.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len() + self.servers.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
