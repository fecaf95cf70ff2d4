// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache tier, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    L1,
    L2,
    /// The backing store
    L3,
}

impl Tier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached value owned by exactly one in-process tier.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Arc<[u8]>,
    pub tier: Tier,
    pub inserted_at: Instant,
    pub last_access_at: Instant,
    pub access_count: u64,
    /// Residency time-to-live in the current tier
    pub ttl: Duration,
    /// Write sequence that produced this value (0 for values read from L3)
    pub seq: u64,
    /// Written locally and not yet acknowledged as persisted
    pub dirty: bool,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Arc<[u8]>, tier: Tier, ttl: Duration, seq: u64, dirty: bool) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            value,
            tier,
            inserted_at: now,
            last_access_at: now,
            access_count: 1,
            ttl,
            seq,
            dirty,
        }
    }

    /// Dirty entries never expire: they are the only copy until the flush lands.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.dirty && now.saturating_duration_since(self.inserted_at) >= self.ttl
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_access_at = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Hand the entry to another tier, starting a fresh residency.
    pub(crate) fn move_to(&mut self, tier: Tier, ttl: Duration, now: Instant) {
        self.tier = tier;
        self.ttl = ttl;
        self.inserted_at = now;
    }
}

/// Lock-free per-tier counters.
#[derive(Debug, Default)]
pub struct TierStats {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    size: AtomicU64,
}

impl TierStats {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn expired(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn promoted(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn demoted(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.size.store(size as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TierStatsSnapshot {
        TierStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed) as usize,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// L3 only: reads that failed or were refused by the breaker
    pub errors: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Entries this tier handed up to a faster tier
    pub promotions: u64,
    /// Entries this tier handed down to a slower tier
    pub demotions: u64,
    pub size: usize,
}
