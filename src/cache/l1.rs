// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L1: fixed capacity, short TTL, least-recently-used eviction.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::entry::{CacheEntry, Tier};

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

/// Not thread-safe; the hierarchy guards it with a mutex.
pub(crate) struct LruTier {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Slot>,
    /// Recency order: smallest tick is least recently used
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl LruTier {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
        }
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Look up and touch. An expired entry is removed and reported as a miss.
    pub(crate) fn get(&mut self, key: &str, now: Instant) -> Option<&CacheEntry> {
        let expired = self.entries.get(key)?.entry.is_expired(now);
        if expired {
            self.remove(key);
            return None;
        }

        let tick = self.tick();
        let slot = self.entries.get_mut(key)?;
        self.order.remove(&slot.tick);
        self.order.insert(tick, key.to_string());
        slot.tick = tick;
        slot.entry.touch(now);
        Some(&slot.entry)
    }

    pub(crate) fn peek_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key).map(|slot| &mut slot.entry)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert as most recently used. Returns whatever had to leave to make room.
    pub(crate) fn insert(&mut self, mut entry: CacheEntry) -> Vec<CacheEntry> {
        entry.tier = Tier::L1;
        self.remove(&entry.key);

        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            match self.pop_lru() {
                Some(old) => evicted.push(old),
                None => break,
            }
        }

        let tick = self.tick();
        self.order.insert(tick, entry.key.clone());
        self.entries.insert(entry.key.clone(), Slot { entry, tick });
        evicted
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot.entry)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key).map(|slot| slot.entry)
    }

    /// Remove every expired entry.
    pub(crate) fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|slot| slot.entry.is_expired(now))
            .map(|slot| slot.entry.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(key: &str, dirty: bool) -> CacheEntry {
        CacheEntry::new(key, Arc::from(key.as_bytes()), Tier::L1, Duration::from_secs(60), 0, dirty)
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut tier = LruTier::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(tier.insert(entry("a", false)).is_empty());
        assert!(tier.insert(entry("b", false)).is_empty());

        // Touch a so b becomes the LRU entry
        assert!(tier.get("a", now).is_some());
        let evicted = tier.insert(entry("c", false));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "b");
        assert!(tier.contains("a"));
        assert!(tier.contains("c"));
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_reinsert_replaces_without_eviction() {
        let mut tier = LruTier::new(2, Duration::from_secs(60));
        tier.insert(entry("a", false));
        tier.insert(entry("b", false));
        assert!(tier.insert(entry("a", true)).is_empty());
        assert_eq!(tier.len(), 2);
        assert!(tier.peek_mut("a").is_some_and(|e| e.dirty));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let mut tier = LruTier::new(4, Duration::from_millis(5));
        let mut e = entry("a", false);
        e.ttl = Duration::from_millis(5);
        let inserted = e.inserted_at;
        tier.insert(e);

        assert!(tier.get("a", inserted + Duration::from_millis(10)).is_none());
        assert!(!tier.contains("a"));
    }

    #[test]
    fn test_purge_keeps_dirty() {
        let mut tier = LruTier::new(4, Duration::ZERO);
        let mut clean = entry("clean", false);
        clean.ttl = Duration::ZERO;
        let mut dirty = entry("dirty", true);
        dirty.ttl = Duration::ZERO;
        tier.insert(clean);
        tier.insert(dirty);

        assert_eq!(tier.purge_expired(Instant::now()), 1);
        assert!(tier.contains("dirty"));
    }
}
