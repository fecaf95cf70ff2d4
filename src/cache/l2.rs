// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L2: larger capacity, longer TTL, least-frequently-used eviction.
//!
//! Access counts are halved on every decay tick so a burst of reads does not
//! pin an entry forever. Clean entries are always evicted before dirty ones;
//! among equals the least frequent, then the oldest, goes first.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::warn;

use super::entry::{CacheEntry, Tier};

/// (dirty, frequency, insertion tick, key): the first element is the victim.
type Rank = (bool, u64, u64, String);

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

impl Slot {
    fn rank(&self) -> Rank {
        (self.entry.dirty, self.entry.access_count, self.tick, self.entry.key.clone())
    }
}

pub(crate) struct LfuTier {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Slot>,
    index: BTreeSet<Rank>,
    next_tick: u64,
}

impl LfuTier {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            index: BTreeSet::new(),
            next_tick: 0,
        }
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up without counting an access.
    pub(crate) fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key).map(|slot| &slot.entry)
    }

    /// Run `f` against an entry and re-rank it afterwards.
    fn update<R>(&mut self, key: &str, f: impl FnOnce(&mut CacheEntry) -> R) -> Option<R> {
        let slot = self.entries.get_mut(key)?;
        self.index.remove(&slot.rank());
        let result = f(&mut slot.entry);
        self.index.insert(slot.rank());
        Some(result)
    }

    /// Look up and count the access. Expired entries are removed.
    pub(crate) fn get(&mut self, key: &str, now: Instant) -> Option<&CacheEntry> {
        if self.entries.get(key)?.entry.is_expired(now) {
            self.remove(key);
            return None;
        }
        self.update(key, |entry| entry.touch(now))?;
        self.entries.get(key).map(|slot| &slot.entry)
    }

    /// Clear the dirty flag if the entry still holds the given write.
    pub(crate) fn mark_clean(&mut self, key: &str, seq: u64) -> bool {
        self.update(key, |entry| {
            if entry.dirty && entry.seq == seq {
                entry.dirty = false;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Insert, evicting the lowest-ranked entries to stay within capacity.
    pub(crate) fn insert(&mut self, mut entry: CacheEntry) -> Vec<CacheEntry> {
        entry.tier = Tier::L2;
        self.remove(&entry.key);

        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            match self.pop_victim() {
                Some(victim) => {
                    if victim.dirty {
                        warn!(key = %victim.key, seq = victim.seq, "L2 full of unflushed writes, evicting dirty entry");
                    }
                    evicted.push(victim);
                }
                None => break,
            }
        }

        self.next_tick += 1;
        let slot = Slot {
            entry,
            tick: self.next_tick,
        };
        self.index.insert(slot.rank());
        self.entries.insert(slot.entry.key.clone(), slot);
        evicted
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.index.remove(&slot.rank());
        Some(slot.entry)
    }

    fn pop_victim(&mut self) -> Option<CacheEntry> {
        let (_, _, _, key) = self.index.pop_first()?;
        self.entries.remove(&key).map(|slot| slot.entry)
    }

    /// Halve every access count.
    pub(crate) fn decay(&mut self) {
        self.index.clear();
        for slot in self.entries.values_mut() {
            slot.entry.access_count /= 2;
            self.index.insert(slot.rank());
        }
    }

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
