// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Write priority. Lower discriminant drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    Normal = 1,
    Background = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Normal, Priority::Background];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
            Self::Background => "background",
        }
    }

    pub(crate) fn lane(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteKind {
    Set { value: Arc<[u8]>, ttl: Option<Duration> },
    /// Refresh the store-side time-to-live of whatever value the key holds
    Expire { ttl: Duration },
}

/// A write owned by the batch processor from enqueue until it is persisted
/// or dead-lettered.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    pub key: String,
    pub kind: WriteKind,
    pub priority: Priority,
    /// Logical writer ("session", "category", ...). Coalescing never lets one
    /// writer's lower-priority write erase another writer's critical one.
    pub origin: &'static str,
    /// Cache write sequence; persisted sequences are acknowledged back to the cache
    pub seq: u64,
    pub enqueued_at: Instant,
    pub attempts: u32,
    /// Backoff gate after a failed flush
    pub not_before: Option<Instant>,
}

impl BatchOperation {
    pub fn set(
        key: impl Into<String>,
        value: Arc<[u8]>,
        ttl: Option<Duration>,
        priority: Priority,
        origin: &'static str,
        seq: u64,
    ) -> Self {
        Self {
            key: key.into(),
            kind: WriteKind::Set { value, ttl },
            priority,
            origin,
            seq,
            enqueued_at: Instant::now(),
            attempts: 0,
            not_before: None,
        }
    }

    pub fn expire(key: impl Into<String>, ttl: Duration, priority: Priority, origin: &'static str, seq: u64) -> Self {
        Self {
            key: key.into(),
            kind: WriteKind::Expire { ttl },
            priority,
            origin,
            seq,
            enqueued_at: Instant::now(),
            attempts: 0,
            not_before: None,
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        matches!(self.kind, WriteKind::Set { .. })
    }

    #[must_use]
    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    /// True when `later` may replace this write in the same batch.
    ///
    /// A pending critical write survives a later lower-priority write from a
    /// different writer; the later one is persisted in a following batch.
    #[must_use]
    pub fn superseded_by(&self, later: &BatchOperation) -> bool {
        let protected =
            self.priority == Priority::Critical && later.priority != Priority::Critical && later.origin != self.origin;
        !protected
    }
}

/// A write that used up its retries and will not be persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub key: String,
    pub priority: Priority,
    pub origin: &'static str,
    pub seq: u64,
    pub attempts: u32,
    pub last_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(priority: Priority, origin: &'static str, seq: u64) -> BatchOperation {
        BatchOperation::set("k", Arc::from(&b"v"[..]), None, priority, origin, seq)
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical < Priority::Normal);
        assert!(Priority::Normal < Priority::Background);
        assert_eq!(Priority::ALL.map(|p| p.lane()), [0, 1, 2]);
    }

    #[test]
    fn test_same_writer_may_supersede_critical() {
        let first = op(Priority::Critical, "session", 1);
        let second = op(Priority::Normal, "session", 2);
        assert!(first.superseded_by(&second));
    }

    #[test]
    fn test_other_writer_cannot_supersede_critical_with_lower_priority() {
        let first = op(Priority::Critical, "session", 1);
        assert!(!first.superseded_by(&op(Priority::Background, "history", 2)));
        assert!(first.superseded_by(&op(Priority::Critical, "history", 2)));
    }

    #[test]
    fn test_backoff_gate() {
        let mut operation = op(Priority::Normal, "session", 1);
        let now = Instant::now();
        assert!(operation.is_ready(now));

        operation.not_before = Some(now + Duration::from_secs(1));
        assert!(!operation.is_ready(now));
        assert!(operation.is_ready(now + Duration::from_secs(2)));
    }
}
