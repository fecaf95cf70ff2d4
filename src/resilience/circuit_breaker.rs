// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding every backing-store call.
//!
//! States:
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls fail fast without touching the store until the cooldown elapses
//! - HalfOpen: exactly one probe call is let through, everything else fails fast
//!
//! Each guarded call runs under a timeout; a timeout counts as a failure.
//! A probe that is dropped before completing (caller cancelled) releases the
//! probe slot so the next caller can probe instead.
//!
//! State, failure count and transition time are mirrored into atomics so the
//! health monitor can read them without taking the breaker's lock.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::HalfOpen,
            _ => Self::Open,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (open, or half-open with a probe in flight)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The call did not complete within the per-call timeout
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// True when the store was never contacted.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed
    pub cooldown: Duration,
    /// Upper bound on a single guarded call
    pub call_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitConfig {
    /// Trips faster, waits longer before probing
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(120),
            call_timeout: Duration::from_secs(5),
        }
    }

    /// Tolerates more failures, probes sooner
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(15),
            call_timeout: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            cooldown: Duration::from_millis(50),
            call_timeout: Duration::from_millis(200),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_transition: Instant,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Point-in-time view of a breaker, for the health monitor.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub time_in_state_ms: u64,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub timeouts: u64,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,

    // Lock-free mirrors for observers
    created: Instant,
    state_code: AtomicU8,
    failures_mirror: AtomicU32,
    transitioned_at_ms: AtomicU64,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    timeouts: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let now = Instant::now();
        let name = name.into();
        crate::metrics::set_circuit_state(&name, CircuitState::Closed as u8);
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_transition: now,
                probe_in_flight: false,
            }),
            created: now,
            state_code: AtomicU8::new(CircuitState::Closed as u8),
            failures_mirror: AtomicU32::new(0),
            transitioned_at_ms: AtomicU64::new(0),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state as last recorded. An open circuit whose cooldown has
    /// elapsed still reads `Open` until the next call turns it half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state_code.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.failures_mirror.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn time_in_state(&self) -> Duration {
        let since_created = self.created.elapsed();
        let at = Duration::from_millis(self.transitioned_at_ms.load(Ordering::Acquire));
        since_created.saturating_sub(at)
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future so nothing runs when the call
    /// is rejected.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let Some(admission) = self.admit() else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, "Circuit breaker rejected call");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Rejected);
        };

        let mut guard = CallGuard {
            breaker: self,
            admission,
            settled: false,
        };

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                guard.settle(true);
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Ok(Err(e)) => {
                guard.settle(false);
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                guard.settle(false);
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, timeout = ?self.config.call_timeout, "Circuit call timed out");
                crate::metrics::record_circuit_call(&self.name, "timeout");
                Err(CircuitError::Timeout(self.config.call_timeout))
            }
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                if inner.last_transition.elapsed() >= self.config.cooldown {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Some(Admission::Probe)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(Admission::Probe)
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (admission, inner.state) {
            (Admission::Probe, _) => {
                inner.probe_in_flight = false;
                inner.consecutive_failures = 0;
                self.transition(&mut inner, CircuitState::Closed);
            }
            (Admission::Normal, CircuitState::Closed) => {
                inner.consecutive_failures = 0;
            }
            // A call admitted before the circuit opened does not close it
            (Admission::Normal, _) => {}
        }
        self.failures_mirror
            .store(inner.consecutive_failures, Ordering::Release);
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (admission, inner.state) {
            (Admission::Probe, _) => {
                inner.probe_in_flight = false;
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                // Re-entering Open restarts the cooldown
                self.transition(&mut inner, CircuitState::Open);
            }
            (Admission::Normal, CircuitState::Closed) => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (Admission::Normal, _) => {}
        }
        self.failures_mirror
            .store(inner.consecutive_failures, Ordering::Release);
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            debug!(circuit = %self.name, "Probe abandoned, slot released");
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Instant::now();

        let since_created = inner.last_transition.duration_since(self.created);
        self.transitioned_at_ms
            .store(since_created.as_millis() as u64, Ordering::Release);
        self.state_code.store(to as u8, Ordering::Release);
        crate::metrics::set_circuit_state(&self.name, to as u8);

        match to {
            CircuitState::Open => warn!(
                circuit = %self.name,
                from = %from,
                consecutive_failures = inner.consecutive_failures,
                cooldown = ?self.config.cooldown,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => info!(circuit = %self.name, "Circuit half-open, probing"),
            CircuitState::Closed => info!(circuit = %self.name, from = %from, "Circuit closed"),
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Failed calls, timeouts included
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls rejected without contacting the store
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            time_in_state_ms: self.time_in_state().as_millis() as u64,
            calls_total: self.calls_total(),
            successes: self.successes(),
            failures: self.failures(),
            rejections: self.rejections(),
            timeouts: self.timeouts(),
        }
    }
}

/// Settles an admitted call. Dropping it unsettled means the caller's
/// future was cancelled mid-call.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success(self.admission);
        } else {
            self.breaker.on_failure(self.admission);
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    async fn fail(cb: &CircuitBreaker) {
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.consecutive_failures(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        fail(&cb).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;

        assert_eq!(cb.consecutive_failures(), 0);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_opens_at_threshold() {
        let config = CircuitConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            call_timeout: Duration::from_secs(1),
        };
        let cb = CircuitBreaker::new("test", config);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // Open circuit never runs the operation
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let result: Result<i32, CircuitError<&str>> = cb
            .call(|| async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(result.unwrap_err().is_rejected());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test]
    async fn test_probe_success_closes_circuit() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(70)).await;

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_and_restarts_cooldown() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        fail(&cb).await;
        fail(&cb).await;

        tokio::time::sleep(Duration::from_millis(70)).await;
        fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.time_in_state() < Duration::from_millis(50));

        // Cooldown restarted: immediate call is rejected
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        assert!(result.unwrap_err().is_rejected());
    }

    #[tokio::test]
    async fn test_single_probe_in_flight() {
        let cb = Arc::new(CircuitBreaker::new("test", CircuitConfig::test()));
        fail(&cb).await;
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(70)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            let result: Result<i32, CircuitError<&str>> = probe_cb
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok(1)
                })
                .await;
            result
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let contender: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(2) }).await;
        assert!(contender.unwrap_err().is_rejected());

        release_tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_probe_releases_slot() {
        let cb = Arc::new(CircuitBreaker::new("test", CircuitConfig::test()));
        fail(&cb).await;
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(70)).await;

        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            let _: Result<i32, CircuitError<&str>> = probe_cb
                .call(|| std::future::pending::<Result<i32, &str>>())
                .await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        probe.abort();
        let _ = probe.await;

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(3) }).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        for _ in 0..2 {
            let result: Result<i32, CircuitError<&str>> = cb
                .call(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(1)
                })
                .await;
            assert!(matches!(result, Err(CircuitError::Timeout(_))));
        }

        assert_eq!(cb.timeouts(), 2);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failure_rate_calculation() {
        let config = CircuitConfig {
            failure_threshold: 100,
            ..CircuitConfig::default()
        };
        let cb = CircuitBreaker::new("test", config);

        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("x") }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(2) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("y") }).await;

        assert!((cb.failure_rate() - 0.5).abs() < 0.01);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.calls_total, 4);
        assert_eq!(snapshot.successes, 2);
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitConfig::default();
        let aggressive = CircuitConfig::aggressive();
        let lenient = CircuitConfig::lenient();

        assert!(aggressive.failure_threshold < default.failure_threshold);
        assert!(lenient.failure_threshold > default.failure_threshold);
        assert!(aggressive.cooldown > lenient.cooldown);
    }
}
