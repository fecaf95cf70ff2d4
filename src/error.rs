// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing error taxonomy.
//!
//! | Class | Variants | Retried? |
//! |-------|----------|----------|
//! | validation | [`EngineError::Validation`] | never |
//! | conflict | [`EngineError::AlreadyActive`], [`EngineError::NoActiveSession`] | never, caller-correctable |
//! | availability | [`EngineError::StoreUnavailable`], [`EngineError::Overloaded`] | by the caller, later |
//!
//! Transient store failures on the write path never show up here: the batch
//! processor retries them internally and reports permanent failures to the
//! health monitor.

use thiserror::Error;

use crate::config::ConfigError;
use crate::resilience::circuit_breaker::CircuitError;
use crate::session::types::{ServerId, UserId};
use crate::storage::traits::StorageError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown category '{category}' in server {server_id}{}", archived_suffix(.archived))]
    UnknownCategory {
        server_id: ServerId,
        category: String,
        archived: bool,
    },
    #[error("invalid category name '{0}': use 1-50 letters, digits, spaces, '-' or '_'")]
    InvalidName(String),
    #[error("category name '{0}' is reserved")]
    ReservedName(String),
    #[error("category '{0}' already exists")]
    DuplicateCategory(String),
    #[error("description is {len} characters, at most {max} allowed")]
    DescriptionTooLong { len: usize, max: usize },
    #[error("invalid colour '{0}', expected #RRGGBB")]
    InvalidColor(String),
    #[error("productivity weight {0} outside 0.0..=5.0")]
    WeightOutOfRange(f64),
    #[error("server already has the maximum of {max} categories")]
    TooManyCategories { max: usize },
    #[error("duration of {seconds}s outside 1..={max}s")]
    InvalidDuration { seconds: u64, max: u64 },
}

fn archived_suffix(archived: &bool) -> &'static str {
    if *archived {
        " (archived)"
    } else {
        ""
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("user {user_id} already has an active session in server {server_id}")]
    AlreadyActive { user_id: UserId, server_id: ServerId },

    #[error("user {user_id} has no active session in server {server_id}")]
    NoActiveSession { user_id: UserId, server_id: ServerId },

    #[error("backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("write queue full ({depth}/{capacity})")]
    Overloaded { depth: usize, capacity: usize },

    #[error("corrupt record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Worth retrying later without changing the request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Overloaded { .. })
    }

    /// The request conflicts with current session state.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyActive { .. } | Self::NoActiveSession { .. })
    }

    pub(crate) fn corrupt(key: &str, err: impl std::fmt::Display) -> Self {
        crate::metrics::record_corruption();
        Self::Corrupt {
            key: key.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<CircuitError<StorageError>> for EngineError {
    fn from(err: CircuitError<StorageError>) -> Self {
        match err {
            CircuitError::Rejected => Self::StoreUnavailable("circuit open".to_string()),
            CircuitError::Timeout(after) => Self::StoreUnavailable(format!("timed out after {:?}", after)),
            CircuitError::Inner(e) => Self::StoreUnavailable(e.to_string()),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classification() {
        let conflict = EngineError::AlreadyActive { user_id: 1, server_id: 2 };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_retryable());

        let overloaded = EngineError::Overloaded { depth: 10, capacity: 10 };
        assert!(overloaded.is_retryable());

        let validation: EngineError = ValidationError::InvalidColor("red".into()).into();
        assert!(!validation.is_retryable());
        assert!(!validation.is_conflict());
    }

    #[test]
    fn test_circuit_errors_map_to_store_unavailable() {
        let rejected: EngineError = CircuitError::<StorageError>::Rejected.into();
        assert_eq!(rejected, EngineError::StoreUnavailable("circuit open".into()));

        let timeout: EngineError = CircuitError::<StorageError>::Timeout(Duration::from_secs(10)).into();
        assert!(matches!(timeout, EngineError::StoreUnavailable(msg) if msg.contains("10s")));

        let inner: EngineError = CircuitError::Inner(StorageError::Backend("conn reset".into())).into();
        assert!(matches!(inner, EngineError::StoreUnavailable(msg) if msg.contains("conn reset")));
    }

    #[test]
    fn test_unknown_category_message() {
        let err = ValidationError::UnknownCategory {
            server_id: 9,
            category: "gaming".into(),
            archived: true,
        };
        assert_eq!(err.to_string(), "unknown category 'gaming' in server 9 (archived)");
    }
}
