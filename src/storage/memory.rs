// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{BackingStore, StorageError};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process backing store. Expired keys are dropped lazily on access.
pub struct InMemoryStore {
    data: DashMap<String, StoredValue>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current key count (including keys whose TTL elapsed but were not yet read)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining time-to-live of a key, if it has one.
    #[must_use]
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .get(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let now = Instant::now();
        let expired = match self.data.get(key) {
            Some(stored) if !stored.is_expired(now) => return Ok(Some(stored.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.data.remove_if(key, |_, v| v.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        self.data.insert(
            key.to_string(),
            StoredValue {
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = Instant::now();
        if ttl.is_zero() {
            return Ok(self.data.remove(key).is_some());
        }
        match self.data.get_mut(key) {
            Some(mut stored) if !stored.is_expired(now) => {
                stored.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
