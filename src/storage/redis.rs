// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backing store.
//!
//! Values are stored as plain Redis strings. Batches go out as a single
//! `MULTI`/`EXEC` pipeline, so a batch is either fully applied or reported
//! as failed as a whole.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{pipe, AsyncCommands, Client};

use super::traits::{BackingStore, BatchEntry, BatchWriteResult, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "timecard:" → "timecard:session:1:2")
    prefix: String,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// ```rust,no_run
    /// # use timecard_engine::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStore::with_prefix("redis://localhost", Some("timecard:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        // Fast-fail at startup instead of hanging on a bad URL
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Redis TTLs are whole seconds; anything shorter rounds up to one.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.connection.clone();
        conn.get(self.prefixed_key(key)).await.map_err(backend)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        match ttl {
            Some(ttl) => conn.set_ex(key, value, ttl_secs(ttl)).await.map_err(backend),
            None => conn.set(key, value).await.map_err(backend),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        if ttl.is_zero() {
            let removed: i64 = conn.del(key).await.map_err(backend)?;
            return Ok(removed > 0);
        }
        conn.expire(key, ttl_secs(ttl) as i64).await.map_err(backend)
    }

    async fn batch_write(&self, entries: &[BatchEntry]) -> Result<BatchWriteResult, StorageError> {
        if entries.is_empty() {
            return Ok(BatchWriteResult::default());
        }

        let mut pipeline = pipe();
        pipeline.atomic();
        for entry in entries {
            let key = self.prefixed_key(&entry.key);
            match entry.ttl {
                Some(ttl) => {
                    pipeline
                        .cmd("SETEX")
                        .arg(&key)
                        .arg(ttl_secs(ttl))
                        .arg(entry.value.as_slice())
                        .ignore();
                }
                None => {
                    pipeline.set(&key, entry.value.as_slice()).ignore();
                }
            }
        }

        let mut conn = self.connection.clone();
        let _: () = pipeline.query_async(&mut conn).await.map_err(backend)?;

        Ok(BatchWriteResult {
            written: entries.len(),
            failed: Vec::new(),
        })
    }
}
