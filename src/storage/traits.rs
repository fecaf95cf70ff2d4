// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// One key/value pair of a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Time-to-live in the store; `None` keeps the value until overwritten.
    pub ttl: Option<Duration>,
}

impl BatchEntry {
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value,
            ttl,
        }
    }
}

/// Outcome of a batch write with per-key failure reporting.
#[derive(Debug, Default)]
pub struct BatchWriteResult {
    /// Number of entries the store acknowledged
    pub written: usize,
    /// Entries the store refused, with the reason
    pub failed: Vec<(String, StorageError)>,
}

impl BatchWriteResult {
    /// True when every entry of the batch was written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The system of record.
///
/// Every call is idempotent at the key level, so the batch processor can
/// replay a failed batch without side effects.
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Set a new time-to-live on an existing key. Returns `false` if the key
    /// does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Write a batch of entries.
    /// Default implementation falls back to sequential sets and reports each
    /// failing key individually.
    async fn batch_write(&self, entries: &[BatchEntry]) -> Result<BatchWriteResult, StorageError> {
        let mut result = BatchWriteResult::default();
        for entry in entries {
            match self.set(&entry.key, &entry.value, entry.ttl).await {
                Ok(()) => result.written += 1,
                Err(e) => result.failed.push((entry.key.clone(), e)),
            }
        }
        Ok(result)
    }
}
