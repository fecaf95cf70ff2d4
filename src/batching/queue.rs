// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority write queue shared by all producers and the single drain loop.
//!
//! Three FIFO lanes (critical, normal, background) behind one short-held
//! lock. Producers only push; the drain loop is the sole consumer and takes
//! whole keys at a time so every write to a key in a batch can be coalesced
//! together.
//!
//! Per-key ordering: writes to one key reach the store in sequence order.
//! While any write to a key is waiting out a retry backoff, every other
//! write to that key is held back too.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error};

use super::operation::{BatchOperation, DeadLetter, Priority};
use crate::backpressure::BackpressureLevel;
use crate::error::EngineError;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// Ready operations reached the count threshold
    Count,
    /// The oldest critical operation used up its latency budget
    CriticalLatency,
    /// Maximum flush interval elapsed
    Interval,
    /// Explicit flush request
    Manual,
    /// Final drain
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::CriticalLatency => "critical_latency",
            Self::Interval => "interval",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued operations before writes are rejected
    pub capacity: usize,
    pub flush_count: usize,
    pub critical_latency: Duration,
    pub max_interval: Duration,
    /// Maximum distinct keys per batch
    pub max_batch: usize,
    pub dead_letter_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 15_000,
            flush_count: 150,
            critical_latency: Duration::from_millis(500),
            max_interval: Duration::from_secs(20),
            max_batch: 500,
            dead_letter_capacity: 1_000,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn from_engine(config: &crate::config::TimecardConfig) -> Self {
        Self {
            capacity: config.max_queue_size,
            flush_count: config.batch_flush_count,
            critical_latency: Duration::from_millis(config.batch_critical_latency_ms),
            max_interval: Duration::from_millis(config.batch_max_flush_interval_ms),
            max_batch: config.batch_max_size,
            dead_letter_capacity: config.dead_letter_capacity,
        }
    }
}

/// All pending writes to one key, coalesced.
#[derive(Debug, Default)]
pub struct KeyWrites {
    pub key: String,
    /// Winning value write, if any
    pub set: Option<BatchOperation>,
    /// TTL refreshes applied after `set`
    pub expires: Vec<BatchOperation>,
}

impl KeyWrites {
    pub fn into_ops(self) -> impl Iterator<Item = BatchOperation> {
        self.set.into_iter().chain(self.expires)
    }
}

/// Result of polling the queue for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub reason: Option<FlushReason>,
    /// When the next time-based trigger fires
    pub wake_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    flushed: AtomicU64,
    coalesced: AtomicU64,
    retried: AtomicU64,
    permanent_failures: AtomicU64,
    rejected: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
}

/// Queue statistics, readable without the queue lock.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub depth_critical: usize,
    pub depth_normal: usize,
    pub depth_background: usize,
    pub capacity: usize,
    pub backpressure: BackpressureLevel,
    pub enqueued: u64,
    pub flushed: u64,
    pub coalesced: u64,
    pub retried: u64,
    pub permanent_failures: u64,
    pub rejected: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub dead_letters: usize,
    /// Milliseconds since the last flush attempt, `None` before the first
    pub last_flush_age_ms: Option<u64>,
}

struct QueueInner {
    lanes: [VecDeque<BatchOperation>; 3],
    last_flush: Instant,
}

const NEVER: u64 = u64::MAX;

pub struct BatchQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    notify: Notify,
    closed: AtomicBool,
    depths: [AtomicUsize; 3],
    counters: Counters,
    created: Instant,
    last_flush_ms: AtomicU64,
}

impl BatchQueue {
    pub fn new(config: QueueConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            inner: Mutex::new(QueueInner {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                last_flush: now,
            }),
            dead_letters: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            depths: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
            counters: Counters::default(),
            created: now,
            last_flush_ms: AtomicU64::new(NEVER),
        }
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Accept a write.
    ///
    /// Fails with `Overloaded` when the queue is full, or when it is nearly
    /// full and the write is background work. Fails with `ShuttingDown`
    /// once the queue is closed.
    pub fn enqueue(&self, op: BatchOperation) -> Result<(), EngineError> {
        self.enqueue_all(vec![op])
    }

    /// Accept every write or none of them, keeping their relative order.
    pub fn enqueue_all(&self, ops: Vec<BatchOperation>) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        if ops.is_empty() {
            return Ok(());
        }

        let priorities: Vec<Priority> = ops.iter().map(|op| op.priority).collect();
        {
            let mut inner = self.inner.lock();
            let depth: usize = inner.lanes.iter().map(VecDeque::len).sum();
            let level = BackpressureLevel::from_fill(depth, self.config.capacity);
            let fits = depth + ops.len() <= self.config.capacity;
            let accepted = fits
                && priorities.iter().all(|priority| match priority {
                    Priority::Background => level.should_accept_background(),
                    _ => level.should_accept_writes(),
                });
            if !accepted {
                drop(inner);
                self.counters.rejected.fetch_add(ops.len() as u64, Ordering::Relaxed);
                crate::metrics::record_overload_rejection();
                debug!(key = %ops[0].key, writes = ops.len(), depth, "Write rejected, queue under pressure");
                return Err(EngineError::Overloaded {
                    depth,
                    capacity: self.config.capacity,
                });
            }
            for op in ops {
                inner.lanes[op.priority.lane()].push_back(op);
            }
            self.publish_depths(&inner);
        }

        self.counters.enqueued.fetch_add(priorities.len() as u64, Ordering::Relaxed);
        for priority in &priorities {
            crate::metrics::record_enqueued(priority.as_str());
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Stop accepting writes. Already queued writes stay for the final drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Total queued operations (lock-free)
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depths.iter().map(|d| d.load(Ordering::Relaxed)).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    #[must_use]
    pub fn backpressure(&self) -> BackpressureLevel {
        BackpressureLevel::from_fill(self.depth(), self.config.capacity)
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Decide whether a flush is due now, and when to look again.
    pub fn poll(&self, now: Instant) -> Poll {
        let inner = self.inner.lock();
        let waiting = waiting_keys(&inner, now);

        let mut takeable = 0usize;
        let mut oldest_critical: Option<Instant> = None;
        let mut next_ready: Option<Instant> = None;

        for lane in &inner.lanes {
            for op in lane {
                if let Some(at) = op.not_before.filter(|at| *at > now) {
                    next_ready = Some(next_ready.map_or(at, |cur: Instant| cur.min(at)));
                    continue;
                }
                if waiting.contains(op.key.as_str()) {
                    continue;
                }
                takeable += 1;
                if op.priority == Priority::Critical {
                    oldest_critical = Some(oldest_critical.map_or(op.enqueued_at, |cur: Instant| cur.min(op.enqueued_at)));
                }
            }
        }

        let critical_due = oldest_critical.map(|at| at + self.config.critical_latency);
        let interval_due = (takeable > 0).then(|| inner.last_flush + self.config.max_interval);

        let reason = if takeable == 0 {
            None
        } else if takeable >= self.config.flush_count {
            Some(FlushReason::Count)
        } else if critical_due.is_some_and(|at| at <= now) {
            Some(FlushReason::CriticalLatency)
        } else if interval_due.is_some_and(|at| at <= now) {
            Some(FlushReason::Interval)
        } else {
            None
        };

        let wake_at = [critical_due, interval_due, next_ready].into_iter().flatten().min();

        Poll { reason, wake_at }
    }

    /// Take up to `max_batch` keys, highest priority first, and coalesce
    /// their writes.
    ///
    /// With `ignore_backoff` set, retry gates are disregarded (final drain).
    pub fn take_batch(&self, now: Instant, ignore_backoff: bool) -> Vec<KeyWrites> {
        let mut inner = self.inner.lock();
        let waiting = if ignore_backoff {
            HashSet::new()
        } else {
            waiting_keys(&inner, now)
        };

        let mut order: Vec<String> = Vec::new();
        let mut selected: HashSet<String> = HashSet::new();
        'lanes: for lane in &inner.lanes {
            for op in lane {
                if order.len() >= self.config.max_batch {
                    break 'lanes;
                }
                let ready = ignore_backoff || op.is_ready(now);
                if ready && !waiting.contains(op.key.as_str()) && selected.insert(op.key.clone()) {
                    order.push(op.key.clone());
                }
            }
        }

        inner.last_flush = now;
        self.last_flush_ms
            .store(now.saturating_duration_since(self.created).as_millis() as u64, Ordering::Relaxed);

        if order.is_empty() {
            return Vec::new();
        }

        let mut grouped: HashMap<String, Vec<BatchOperation>> = HashMap::with_capacity(order.len());
        for lane in inner.lanes.iter_mut() {
            let pending = std::mem::take(lane);
            for op in pending {
                if selected.contains(&op.key) {
                    grouped.entry(op.key.clone()).or_default().push(op);
                } else {
                    lane.push_back(op);
                }
            }
        }

        let mut batch = Vec::with_capacity(order.len());
        let mut deferred = Vec::new();
        let mut coalesced = 0usize;
        for key in order {
            let Some(mut ops) = grouped.remove(&key) else { continue };
            ops.sort_by_key(|op| op.seq);
            let (writes, superseded, held) = coalesce(key, ops);
            coalesced += superseded;
            deferred.extend(held);
            batch.push(writes);
        }

        // Held-back writes go first in line for the next batch, in sequence order
        for op in deferred.into_iter().rev() {
            inner.lanes[op.priority.lane()].push_front(op);
        }
        self.publish_depths(&inner);
        drop(inner);

        if coalesced > 0 {
            self.counters.coalesced.fetch_add(coalesced as u64, Ordering::Relaxed);
            crate::metrics::record_coalesced(coalesced);
        }
        batch
    }

    /// Put failed writes back with their backoff gate already set.
    pub fn requeue(&self, mut ops: Vec<BatchOperation>) {
        if ops.is_empty() {
            return;
        }
        let count = ops.len();
        ops.sort_by_key(|op| std::cmp::Reverse(op.seq));
        {
            let mut inner = self.inner.lock();
            for op in ops {
                inner.lanes[op.priority.lane()].push_front(op);
            }
            self.publish_depths(&inner);
        }
        self.counters.retried.fetch_add(count as u64, Ordering::Relaxed);
        crate::metrics::record_requeued(count);
    }

    /// Record writes that will never be persisted.
    pub fn dead_letter(&self, failed: Vec<DeadLetter>) {
        if failed.is_empty() {
            return;
        }
        let count = failed.len();
        let mut letters = self.dead_letters.lock();
        for letter in failed {
            error!(
                key = %letter.key,
                priority = %letter.priority,
                origin = letter.origin,
                attempts = letter.attempts,
                error = %letter.last_error,
                "Write permanently failed"
            );
            if letters.len() >= self.config.dead_letter_capacity {
                letters.pop_front();
            }
            letters.push_back(letter);
        }
        drop(letters);
        self.counters
            .permanent_failures
            .fetch_add(count as u64, Ordering::Relaxed);
        crate::metrics::record_permanent_failures(count);
    }

    /// Most recent permanent failures, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    pub(crate) fn record_flush(&self, persisted: usize, success: bool) {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .flushed
            .fetch_add(persisted as u64, Ordering::Relaxed);
        if !success {
            self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let depth_of = |p: Priority| self.depths[p.lane()].load(Ordering::Relaxed);
        let depth = self.depth();
        let last_flush = self.last_flush_ms.load(Ordering::Relaxed);
        let now_ms = self.created.elapsed().as_millis() as u64;
        QueueStats {
            depth,
            depth_critical: depth_of(Priority::Critical),
            depth_normal: depth_of(Priority::Normal),
            depth_background: depth_of(Priority::Background),
            capacity: self.config.capacity,
            backpressure: BackpressureLevel::from_fill(depth, self.config.capacity),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            permanent_failures: self.counters.permanent_failures.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            failed_flushes: self.counters.failed_flushes.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.lock().len(),
            last_flush_age_ms: (last_flush != NEVER).then(|| now_ms.saturating_sub(last_flush)),
        }
    }

    fn publish_depths(&self, inner: &QueueInner) {
        for priority in Priority::ALL {
            let depth = inner.lanes[priority.lane()].len();
            self.depths[priority.lane()].store(depth, Ordering::Relaxed);
            crate::metrics::set_queue_depth(priority.as_str(), depth);
        }
    }
}

fn waiting_keys(inner: &QueueInner, now: Instant) -> HashSet<&str> {
    inner
        .lanes
        .iter()
        .flatten()
        .filter(|op| !op.is_ready(now))
        .map(|op| op.key.as_str())
        .collect()
}

/// Coalesce one key's writes (sorted by sequence).
///
/// Returns the writes to flush, how many operations were superseded, and
/// the operations held back for the next batch.
fn coalesce(key: String, ops: Vec<BatchOperation>) -> (KeyWrites, usize, Vec<BatchOperation>) {
    let mut writes = KeyWrites {
        key,
        set: None,
        expires: Vec::new(),
    };
    let mut superseded = 0usize;
    let mut held = Vec::new();

    for mut op in ops {
        if !held.is_empty() {
            held.push(op);
            continue;
        }
        // Taken writes start fresh; failures set a new gate
        op.not_before = None;
        if !op.is_set() {
            writes.expires.push(op);
            continue;
        }
        match writes.set.take() {
            Some(previous) if !previous.superseded_by(&op) => {
                writes.set = Some(previous);
                held.push(op);
            }
            previous => {
                // A newer value carries its own TTL
                superseded += usize::from(previous.is_some()) + writes.expires.len();
                writes.expires.clear();
                writes.set = Some(op);
            }
        }
    }

    (writes, superseded, held)
}
