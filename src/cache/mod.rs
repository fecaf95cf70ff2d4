// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Three-tier cache with write-behind persistence.
//!
//! ```text
//!   read:  L1 (LRU) ──miss──> L2 (LFU) ──miss──> L3 (store, via breaker)
//!            ^                  │                   │
//!            └──── promote ─────┘                   │
//!            └──────────── install if no newer write┘
//!
//!   write: seq++ ─> enqueue ─> install at write point ─> drop other tier
//! ```
//!
//! # Lock order
//!
//! Always L1 then L2. A write enqueues its batch operation while holding
//! both, so queue order matches cache order for every key. No lock is held
//! across a store call.
//!
//! # Dirty entries
//!
//! A written entry stays dirty until the batch processor acknowledges its
//! sequence number. Dirty entries never expire, L1 always demotes them to L2
//! on eviction, and L2 evicts clean entries first.

pub mod entry;
mod l1;
mod l2;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

pub use entry::{CacheEntry, Tier, TierStats, TierStatsSnapshot};

use crate::batching::{BatchOperation, BatchQueue, FlushObserver, Priority};
use crate::config::TimecardConfig;
use crate::error::{EngineError, Result};
use crate::resilience::CircuitBreaker;
use crate::storage::BackingStore;
use l1::LruTier;
use l2::LfuTier;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub l1_capacity: usize,
    pub l1_ttl: Duration,
    pub l2_capacity: usize,
    pub l2_ttl: Duration,
    /// L1 evictions with more accesses than this demote instead of dropping
    pub promotion_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from_engine(&TimecardConfig::default())
    }
}

impl CacheConfig {
    pub fn from_engine(config: &TimecardConfig) -> Self {
        Self {
            l1_capacity: config.l1_capacity,
            l1_ttl: Duration::from_secs(config.l1_ttl_secs),
            l2_capacity: config.l2_capacity,
            l2_ttl: Duration::from_secs(config.l2_ttl_secs),
            promotion_threshold: config.promotion_threshold,
        }
    }
}

/// How a write is cached and persisted.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub priority: Priority,
    /// Logical writer, used by batch coalescing
    pub origin: &'static str,
    /// Store-side time-to-live
    pub ttl: Option<Duration>,
    /// Tier that takes ownership of the value
    pub tier: Tier,
}

impl WriteOptions {
    pub fn hot(priority: Priority, origin: &'static str) -> Self {
        Self {
            priority,
            origin,
            ttl: None,
            tier: Tier::L1,
        }
    }

    pub fn warm(priority: Priority, origin: &'static str) -> Self {
        Self {
            tier: Tier::L2,
            ..Self::hot(priority, origin)
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub l1: TierStatsSnapshot,
    pub l2: TierStatsSnapshot,
    pub l3: TierStatsSnapshot,
    pub lookups: u64,
    /// Share of lookups served by L1 or L2
    #[serde(serialize_with = "round3")]
    pub hit_rate: f64,
}

fn round3<S: Serializer>(value: &f64, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64((value * 1000.0).round() / 1000.0)
}

pub struct CacheHierarchy {
    config: CacheConfig,
    l1: Mutex<LruTier>,
    l2: Mutex<LfuTier>,
    store: Arc<dyn BackingStore>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<BatchQueue>,
    /// Bumped by every write and invalidation
    seq: AtomicU64,
    lookups: AtomicU64,
    l1_stats: TierStats,
    l2_stats: TierStats,
    l3_stats: TierStats,
}

impl CacheHierarchy {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn BackingStore>,
        breaker: Arc<CircuitBreaker>,
        queue: Arc<BatchQueue>,
    ) -> Self {
        Self {
            l1: Mutex::new(LruTier::new(config.l1_capacity, config.l1_ttl)),
            l2: Mutex::new(LfuTier::new(config.l2_capacity, config.l2_ttl)),
            config,
            store,
            breaker,
            queue,
            seq: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            l1_stats: TierStats::default(),
            l2_stats: TierStats::default(),
            l3_stats: TierStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read through every tier.
    ///
    /// Store failures surface as `StoreUnavailable`; a miss at L3 is `None`
    /// and is not cached.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(value) = self.lookup_local(key) {
            return Ok(Some(value));
        }

        let generation = self.seq.load(Ordering::Acquire);
        let read = self.breaker.call(|| self.store.get(key)).await;
        let bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.l3_stats.miss();
                crate::metrics::record_cache_lookup(Tier::L3.as_str(), "miss");
                return Ok(None);
            }
            Err(e) => {
                self.l3_stats.error();
                crate::metrics::record_cache_lookup(Tier::L3.as_str(), "error");
                return Err(EngineError::from(e));
            }
        };
        self.l3_stats.hit();
        crate::metrics::record_cache_lookup(Tier::L3.as_str(), "hit");

        let value: Arc<[u8]> = Arc::from(bytes);
        self.install_clean(key, value.clone(), generation);
        Ok(Some(value))
    }

    /// Read L1 and L2 only. Never touches the store.
    pub fn get_local(&self, key: &str) -> Option<Arc<[u8]>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.lookup_local(key)
    }

    fn lookup_local(&self, key: &str) -> Option<Arc<[u8]>> {
        let now = Instant::now();
        let mut l1 = self.l1.lock();
        if let Some(entry) = l1.get(key, now) {
            self.l1_stats.hit();
            crate::metrics::record_cache_lookup(Tier::L1.as_str(), "hit");
            return Some(entry.value.clone());
        }
        self.l1_stats.miss();
        crate::metrics::record_cache_lookup(Tier::L1.as_str(), "miss");

        // Promotion moves the entry while both locks are held, so no reader
        // sees it in neither tier or in both.
        let mut l2 = self.l2.lock();
        if l2.get(key, now).is_none() {
            self.l2_stats.miss();
            crate::metrics::record_cache_lookup(Tier::L2.as_str(), "miss");
            return None;
        }
        self.l2_stats.hit();
        crate::metrics::record_cache_lookup(Tier::L2.as_str(), "hit");

        let mut entry = l2.remove(key)?;
        let value = entry.value.clone();
        entry.move_to(Tier::L1, l1.ttl(), now);
        self.l2_stats.promoted();
        crate::metrics::record_cache_promotion(Tier::L2.as_str());
        let evicted = l1.insert(entry);
        self.place_evicted(evicted, &mut l2, now);
        self.publish_sizes(&l1, &l2);
        Some(value)
    }

    fn install_clean(&self, key: &str, value: Arc<[u8]>, generation: u64) {
        let mut l1 = self.l1.lock();
        let mut l2 = self.l2.lock();
        if self.seq.load(Ordering::Acquire) != generation || l1.contains(key) || l2.contains(key) {
            debug!(key, "L3 read raced a newer write, not installing");
            return;
        }
        let entry = CacheEntry::new(key, value, Tier::L1, l1.ttl(), 0, false);
        let evicted = l1.insert(entry);
        self.place_evicted(evicted, &mut l2, Instant::now());
        self.publish_sizes(&l1, &l2);
    }

    /// L1 evictions demote or drop. Called with both locks held.
    fn place_evicted(&self, evicted: Vec<CacheEntry>, l2: &mut LfuTier, now: Instant) {
        for mut entry in evicted {
            self.l1_stats.evicted();
            if entry.dirty || entry.access_count > self.config.promotion_threshold {
                entry.move_to(Tier::L2, l2.ttl(), now);
                self.l1_stats.demoted();
                crate::metrics::record_cache_eviction(Tier::L1.as_str(), "demoted");
                self.drop_from_l2(l2.insert(entry));
            } else {
                crate::metrics::record_cache_eviction(Tier::L1.as_str(), "dropped");
            }
        }
    }

    fn drop_from_l2(&self, evicted: Vec<CacheEntry>) {
        for _ in evicted {
            self.l2_stats.evicted();
            crate::metrics::record_cache_eviction(Tier::L2.as_str(), "dropped");
        }
    }

    /// Write-through to the cache, write-behind to the store.
    ///
    /// The batch operation is enqueued before the value is installed; if the
    /// queue refuses it the cache is left untouched. Returns the write's
    /// sequence number.
    #[tracing::instrument(skip(self, value), fields(tier = %options.tier, priority = %options.priority))]
    pub fn put(&self, key: &str, value: Arc<[u8]>, options: WriteOptions) -> Result<u64> {
        let seqs = self.put_many(vec![(key.to_string(), value, options)])?;
        Ok(seqs[0])
    }

    /// Several writes accepted or refused together, enqueued in order.
    pub fn put_many(&self, writes: Vec<(String, Arc<[u8]>, WriteOptions)>) -> Result<Vec<u64>> {
        let now = Instant::now();
        let mut l1 = self.l1.lock();
        let mut l2 = self.l2.lock();

        let base = self.seq.load(Ordering::Acquire);
        let ops = writes
            .iter()
            .zip(1u64..)
            .map(|((key, value, options), offset)| {
                BatchOperation::set(
                    key.as_str(),
                    value.clone(),
                    options.ttl,
                    options.priority,
                    options.origin,
                    base + offset,
                )
            })
            .collect();
        // Both locks are held, so no other writer moves the counter meanwhile
        self.queue.enqueue_all(ops)?;
        self.seq.fetch_add(writes.len() as u64, Ordering::AcqRel);

        let mut seqs = Vec::with_capacity(writes.len());
        for ((key, value, options), offset) in writes.into_iter().zip(1u64..) {
            let seq = base + offset;
            match options.tier {
                Tier::L2 => {
                    l1.remove(&key);
                    let entry = CacheEntry::new(key, value, Tier::L2, l2.ttl(), seq, true);
                    self.drop_from_l2(l2.insert(entry));
                }
                // L3 is never a write point; treat it as hot
                Tier::L1 | Tier::L3 => {
                    l2.remove(&key);
                    let entry = CacheEntry::new(key, value, Tier::L1, l1.ttl(), seq, true);
                    let evicted = l1.insert(entry);
                    self.place_evicted(evicted, &mut l2, now);
                }
            }
            seqs.push(seq);
        }
        self.publish_sizes(&l1, &l2);
        Ok(seqs)
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, options: WriteOptions) -> Result<u64> {
        self.put(key, encode(key, value)?, options)
    }

    /// Refresh the store-side TTL of a key without rewriting its value.
    pub fn refresh_ttl(&self, key: &str, ttl: Duration, priority: Priority, origin: &'static str) -> Result<()> {
        let seq = self.seq.load(Ordering::Acquire);
        self.queue.enqueue(BatchOperation::expire(key, ttl, priority, origin, seq))
    }

    /// Drop a key from every in-process tier. The next read goes to L3.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut l1 = self.l1.lock();
        let mut l2 = self.l2.lock();
        self.seq.fetch_add(1, Ordering::AcqRel);
        let removed_l1 = l1.remove(key);
        let removed_l2 = l2.remove(key);
        if removed_l1.iter().chain(removed_l2.iter()).any(|entry| entry.dirty) {
            warn!(key, "Invalidated an entry with an unflushed write");
        }
        self.publish_sizes(&l1, &l2);
        removed_l1.is_some() || removed_l2.is_some()
    }

    /// Tier currently holding a key, if any.
    pub fn tier_of(&self, key: &str) -> Option<Tier> {
        let l1 = self.l1.lock();
        if l1.contains(key) {
            return Some(Tier::L1);
        }
        let l2 = self.l2.lock();
        l2.contains(key).then_some(Tier::L2)
    }

    /// True when the key holds a write the store has not acknowledged yet.
    pub fn is_dirty(&self, key: &str) -> bool {
        let mut l1 = self.l1.lock();
        if let Some(entry) = l1.peek_mut(key) {
            return entry.dirty;
        }
        self.l2.lock().peek(key).is_some_and(|entry| entry.dirty)
    }

    /// Remove expired clean entries from both tiers.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut l1 = self.l1.lock();
        let mut l2 = self.l2.lock();
        let from_l1 = l1.purge_expired(now);
        let from_l2 = l2.purge_expired(now);
        self.l1_stats.expired(from_l1);
        self.l2_stats.expired(from_l2);
        for _ in 0..from_l1 {
            crate::metrics::record_cache_eviction(Tier::L1.as_str(), "expired");
        }
        for _ in 0..from_l2 {
            crate::metrics::record_cache_eviction(Tier::L2.as_str(), "expired");
        }
        self.publish_sizes(&l1, &l2);
        from_l1 + from_l2
    }

    /// Halve L2 access counts.
    pub fn decay(&self) {
        self.l2.lock().decay();
    }

    fn publish_sizes(&self, l1: &LruTier, l2: &LfuTier) {
        self.l1_stats.set_size(l1.len());
        self.l2_stats.set_size(l2.len());
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let l1 = self.l1_stats.snapshot();
        let l2 = self.l2_stats.snapshot();
        let l3 = self.l3_stats.snapshot();
        let lookups = self.lookups.load(Ordering::Relaxed);
        let hit_rate = if lookups == 0 {
            1.0
        } else {
            (l1.hits + l2.hits) as f64 / lookups as f64
        };
        CacheStatsSnapshot {
            l1,
            l2,
            l3,
            lookups,
            hit_rate,
        }
    }

    /// Read and decode a JSON record.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Serialize a record for [`CacheHierarchy::put_many`].
pub fn encode<T: Serialize>(key: &str, value: &T) -> Result<Arc<[u8]>> {
    serde_json::to_vec(value)
        .map(Arc::from)
        .map_err(|e| EngineError::corrupt(key, e))
}

/// Inverse of [`encode`]; undecodable bytes are reported as `Corrupt`.
pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::corrupt(key, e))
}

impl FlushObserver for CacheHierarchy {
    fn on_persisted(&self, key: &str, seq: u64) {
        let mut l1 = self.l1.lock();
        if let Some(entry) = l1.peek_mut(key) {
            if entry.dirty && entry.seq == seq {
                entry.dirty = false;
            }
            return;
        }
        let mut l2 = self.l2.lock();
        l2.mark_clean(key, seq);
    }
}

impl std::fmt::Debug for CacheHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHierarchy")
            .field("config", &self.config)
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
