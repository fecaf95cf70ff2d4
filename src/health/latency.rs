// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rolling latency percentiles without locks.
//!
//! Two windows of power-of-two microsecond buckets. Recording is a couple of
//! relaxed atomic adds into the current window. When the current window ages
//! past half the rolling span the other one is cleared and becomes current, so
//! a summary always covers between half and all of the configured span.
//! Percentiles report the upper bound of the bucket they fall in.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

const BUCKETS: usize = 40;

struct Window {
    buckets: [AtomicU64; BUCKETS],
    max_us: AtomicU64,
}

impl Window {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            max_us: AtomicU64::new(0),
        }
    }

    fn clear(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.max_us.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

pub struct LatencyTracker {
    windows: [Window; 2],
    current: AtomicUsize,
    /// Milliseconds since `origin` when the current window started
    rotated_at_ms: AtomicU64,
    half_span: Duration,
    origin: Instant,
}

impl LatencyTracker {
    pub fn new(span: Duration) -> Self {
        Self {
            windows: [Window::new(), Window::new()],
            current: AtomicUsize::new(0),
            rotated_at_ms: AtomicU64::new(0),
            half_span: (span / 2).max(Duration::from_millis(1)),
            origin: Instant::now(),
        }
    }

    fn bucket_for(micros: u64) -> usize {
        // 0-1us in bucket 0, then [2^i, 2^(i+1)) in bucket i
        let bucket = (u64::BITS - micros.leading_zeros()).saturating_sub(1) as usize;
        bucket.min(BUCKETS - 1)
    }

    fn bucket_upper_ms(bucket: usize) -> f64 {
        (1u64 << (bucket + 1)) as f64 / 1000.0
    }

    fn maybe_rotate(&self) {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let started = self.rotated_at_ms.load(Ordering::Acquire);
        let half_ms = (self.half_span.as_millis() as u64).max(1);
        let elapsed_halves = now_ms.saturating_sub(started) / half_ms;
        if elapsed_halves == 0 {
            return;
        }
        // One caller wins the rotation; the rest keep recording
        if self
            .rotated_at_ms
            .compare_exchange(started, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let current = self.current.load(Ordering::Acquire);
            let next = 1 - current;
            self.windows[next].clear();
            // Idle for a full span or more: nothing recorded so far is still in range
            if elapsed_halves >= 2 {
                self.windows[current].clear();
            }
            self.current.store(next, Ordering::Release);
        }
    }

    pub fn record(&self, latency: Duration) {
        self.maybe_rotate();
        let micros = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        let window = &self.windows[self.current.load(Ordering::Acquire)];
        window.buckets[Self::bucket_for(micros)].fetch_add(1, Ordering::Relaxed);
        window.max_us.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn summary(&self) -> LatencySummary {
        self.maybe_rotate();
        let mut buckets = [0u64; BUCKETS];
        let mut max_us = 0;
        for window in &self.windows {
            for (total, bucket) in buckets.iter_mut().zip(&window.buckets) {
                *total += bucket.load(Ordering::Relaxed);
            }
            max_us = max_us.max(window.max_us.load(Ordering::Relaxed));
        }
        let count: u64 = buckets.iter().sum();
        if count == 0 {
            return LatencySummary::default();
        }

        let percentile = |q: f64| -> f64 {
            let rank = ((count as f64) * q).ceil().max(1.0) as u64;
            let mut seen = 0;
            for (i, n) in buckets.iter().enumerate() {
                seen += n;
                if seen >= rank {
                    return Self::bucket_upper_ms(i).min(max_us as f64 / 1000.0);
                }
            }
            max_us as f64 / 1000.0
        };

        LatencySummary {
            count,
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
            max_ms: max_us as f64 / 1000.0,
        }
    }
}

impl std::fmt::Debug for LatencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyTracker")
            .field("half_span", &self.half_span)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        let tracker = LatencyTracker::new(Duration::from_secs(60));
        assert_eq!(tracker.summary(), LatencySummary::default());
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(LatencyTracker::bucket_for(0), 0);
        assert_eq!(LatencyTracker::bucket_for(1), 0);
        assert_eq!(LatencyTracker::bucket_for(2), 1);
        assert_eq!(LatencyTracker::bucket_for(1023), 9);
        assert_eq!(LatencyTracker::bucket_for(1024), 10);
        assert_eq!(LatencyTracker::bucket_for(u64::MAX), BUCKETS - 1);
    }

    #[test]
    fn test_percentiles_track_distribution() {
        let tracker = LatencyTracker::new(Duration::from_secs(60));
        for _ in 0..98 {
            tracker.record(Duration::from_micros(100));
        }
        tracker.record(Duration::from_millis(50));
        tracker.record(Duration::from_millis(50));

        let summary = tracker.summary();
        assert_eq!(summary.count, 100);
        // 100us lands in [64, 128)us
        assert!((summary.p50_ms - 0.128).abs() < 1e-9);
        assert!((summary.p95_ms - 0.128).abs() < 1e-9);
        // p99 lands in the slow bucket, capped at the observed max
        assert!((summary.p99_ms - 50.0).abs() < 1e-9);
        assert!((summary.max_ms - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_old_samples_roll_out() {
        let tracker = LatencyTracker::new(Duration::from_millis(20));
        tracker.record(Duration::from_millis(5));

        std::thread::sleep(Duration::from_millis(15));
        tracker.record(Duration::from_micros(10));
        assert_eq!(tracker.summary().count, 2);

        std::thread::sleep(Duration::from_millis(15));
        let summary = tracker.summary();
        assert!(summary.count <= 1);
        assert!(summary.max_ms < 5.0);
    }

    #[test]
    fn test_idle_gap_clears_both_windows() {
        let tracker = LatencyTracker::new(Duration::from_millis(20));
        tracker.record(Duration::from_millis(500));
        assert_eq!(tracker.summary().count, 1);

        std::thread::sleep(Duration::from_millis(200));
        let summary = tracker.summary();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.max_ms, 0.0);

        tracker.record(Duration::from_micros(10));
        assert_eq!(tracker.summary().count, 1);
    }
}
