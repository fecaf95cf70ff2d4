// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The drain loop: the single consumer of the write queue.
//!
//! Every store call made here goes through the circuit breaker. A failed
//! flush never loses writes: each member is requeued with a backoff gate,
//! or dead-lettered once it has used up its retries. Calls the breaker
//! rejects without contacting the store do not count as attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::operation::{BatchOperation, DeadLetter, WriteKind};
use super::queue::{BatchQueue, FlushReason, KeyWrites};
use crate::error::EngineError;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::resilience::retry::RetryConfig;
use crate::storage::traits::{BackingStore, BatchEntry, StorageError};

/// Notified when a write is durably persisted.
pub trait FlushObserver: Send + Sync {
    fn on_persisted(&self, key: &str, seq: u64);
}

/// Result of one flush cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushOutcome {
    pub keys: usize,
    pub persisted: usize,
    pub requeued: usize,
    /// Writes given up on during this cycle
    pub dead_letters: Vec<DeadLetter>,
    /// The breaker refused at least one call
    pub rejected: bool,
}

impl FlushOutcome {
    fn absorb(&mut self, other: FlushOutcome) {
        self.keys += other.keys;
        self.persisted += other.persisted;
        self.requeued += other.requeued;
        self.dead_letters.extend(other.dead_letters);
        self.rejected |= other.rejected;
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.requeued == 0 && self.dead_letters.is_empty() && !self.rejected
    }
}

/// What the final drain could not persist.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub persisted: usize,
    pub unpersisted: Vec<DeadLetter>,
}

enum Command {
    Flush(oneshot::Sender<FlushOutcome>),
    Shutdown(oneshot::Sender<ShutdownReport>),
}

struct Failure {
    op: BatchOperation,
    error: String,
    rejected: bool,
}

pub struct BatchProcessor {
    queue: Arc<BatchQueue>,
    store: Arc<dyn BackingStore>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    observer: Option<Arc<dyn FlushObserver>>,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<BatchQueue>,
        store: Arc<dyn BackingStore>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            queue,
            store,
            breaker,
            retry,
            observer: None,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn FlushObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Start the drain loop on the current runtime.
    pub fn spawn(self) -> ProcessorHandle {
        let (tx, rx) = mpsc::channel(8);
        let queue = self.queue.clone();
        let task = tokio::spawn(self.run(rx));
        ProcessorHandle {
            commands: tx,
            task: Mutex::new(Some(task)),
            queue,
        }
    }

    #[tracing::instrument(skip_all, name = "batch_processor")]
    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        info!("Batch processor running");
        loop {
            let poll = self.queue.poll(Instant::now());
            if let Some(reason) = poll.reason {
                self.flush_once(reason, false).await;
                continue;
            }

            let wake = async {
                match poll.wake_at {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.queue.notified() => {}
                _ = wake => {}
                command = commands.recv() => match command {
                    Some(Command::Flush(reply)) => {
                        let outcome = self.flush_ready().await;
                        let _ = reply.send(outcome);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let report = self.drain().await;
                        let _ = reply.send(report);
                        return;
                    }
                    None => {
                        // Handle dropped without an explicit shutdown
                        self.drain().await;
                        return;
                    }
                }
            }
        }
    }

    /// Flush everything currently ready, stopping at the first unclean cycle.
    async fn flush_ready(&self) -> FlushOutcome {
        let mut total = FlushOutcome::default();
        loop {
            let Some(outcome) = self.flush_once(FlushReason::Manual, false).await else {
                break;
            };
            let clean = outcome.is_clean();
            total.absorb(outcome);
            if !clean {
                break;
            }
        }
        total
    }

    /// Final drain: one attempt per write, backoff gates ignored, nothing requeued.
    async fn drain(&self) -> ShutdownReport {
        self.queue.close();
        let mut total = FlushOutcome::default();
        while let Some(outcome) = self.flush_once(FlushReason::Shutdown, true).await {
            total.absorb(outcome);
        }

        let unpersisted = total.dead_letters;
        if unpersisted.is_empty() {
            info!(persisted = total.persisted, "Batch processor drained");
        } else {
            warn!(
                persisted = total.persisted,
                unpersisted = unpersisted.len(),
                "Batch processor drained with unpersisted writes"
            );
        }
        ShutdownReport {
            persisted: total.persisted,
            unpersisted,
        }
    }

    /// Take and flush one batch. `None` when nothing was takeable.
    async fn flush_once(&self, reason: FlushReason, final_drain: bool) -> Option<FlushOutcome> {
        let batch = self.queue.take_batch(Instant::now(), final_drain);
        if batch.is_empty() {
            return None;
        }
        Some(self.flush_batch(batch, reason, final_drain).await)
    }

    async fn flush_batch(&self, batch: Vec<KeyWrites>, reason: FlushReason, final_drain: bool) -> FlushOutcome {
        let started = Instant::now();
        let mut outcome = FlushOutcome {
            keys: batch.len(),
            ..Default::default()
        };

        let entries: Vec<BatchEntry> = batch
            .iter()
            .filter_map(|writes| writes.set.as_ref().and_then(to_entry))
            .collect();

        // Per-key failures, or one failure covering every value write
        let mut failed_keys: HashMap<String, String> = HashMap::new();
        let mut batch_failure: Option<(String, bool)> = None;
        if !entries.is_empty() {
            match self.breaker.call(|| self.store.batch_write(&entries)).await {
                Ok(result) => {
                    for (key, err) in result.failed {
                        failed_keys.insert(key, err.to_string());
                    }
                }
                Err(err) => batch_failure = Some(describe(&err)),
            }
        }

        let mut failures = Vec::new();
        for writes in batch {
            let set_failure = match &writes.set {
                None => None,
                Some(_) => batch_failure
                    .clone()
                    .or_else(|| failed_keys.get(&writes.key).map(|e| (e.clone(), false))),
            };

            if let Some((error, rejected)) = set_failure {
                failures.extend(writes.into_ops().map(|op| Failure {
                    op,
                    error: error.clone(),
                    rejected,
                }));
                continue;
            }

            if let Some(op) = &writes.set {
                outcome.persisted += 1;
                if let Some(observer) = &self.observer {
                    observer.on_persisted(&op.key, op.seq);
                }
            }

            for op in writes.expires {
                let WriteKind::Expire { ttl } = op.kind else { continue };
                match self.breaker.call(|| self.store.expire(&op.key, ttl)).await {
                    Ok(_) => outcome.persisted += 1,
                    Err(err) => {
                        let (error, rejected) = describe(&err);
                        failures.push(Failure { op, error, rejected });
                    }
                }
            }
        }

        outcome.rejected = failures.iter().any(|f| f.rejected);
        let success = failures.is_empty();
        self.settle_failures(failures, final_drain, &mut outcome);
        self.queue.record_flush(outcome.persisted, success);

        let status = if success { "success" } else { "error" };
        crate::metrics::record_flush(reason.as_str(), outcome.keys, status, started.elapsed());
        if success {
            debug!(
                reason = reason.as_str(),
                keys = outcome.keys,
                persisted = outcome.persisted,
                elapsed = ?started.elapsed(),
                "Batch flushed"
            );
        } else {
            warn!(
                reason = reason.as_str(),
                keys = outcome.keys,
                persisted = outcome.persisted,
                requeued = outcome.requeued,
                dead_lettered = outcome.dead_letters.len(),
                circuit_rejected = outcome.rejected,
                "Batch flush incomplete"
            );
        }
        outcome
    }

    fn settle_failures(&self, failures: Vec<Failure>, final_drain: bool, outcome: &mut FlushOutcome) {
        let now = Instant::now();
        let mut requeue = Vec::new();
        let mut dead = Vec::new();

        for Failure { mut op, error, rejected } in failures {
            if !rejected {
                op.attempts += 1;
            }
            if final_drain || self.retry.is_exhausted(op.attempts) {
                dead.push(DeadLetter {
                    key: op.key,
                    priority: op.priority,
                    origin: op.origin,
                    seq: op.seq,
                    attempts: op.attempts,
                    last_error: error,
                });
            } else {
                op.not_before = Some(now + self.retry.delay_for_attempt(op.attempts));
                requeue.push(op);
            }
        }

        outcome.requeued += requeue.len();
        outcome.dead_letters.extend(dead.iter().cloned());
        self.queue.requeue(requeue);
        self.queue.dead_letter(dead);
    }
}

fn to_entry(op: &BatchOperation) -> Option<BatchEntry> {
    match &op.kind {
        WriteKind::Set { value, ttl } => Some(BatchEntry::new(op.key.clone(), value.to_vec(), *ttl)),
        WriteKind::Expire { .. } => None,
    }
}

fn describe(err: &CircuitError<StorageError>) -> (String, bool) {
    (err.to_string(), err.is_rejected())
}

/// Control handle for a running batch processor.
pub struct ProcessorHandle {
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    queue: Arc<BatchQueue>,
}

impl ProcessorHandle {
    #[must_use]
    pub fn queue(&self) -> &Arc<BatchQueue> {
        &self.queue
    }

    /// Flush every ready write now and wait for the outcome.
    pub async fn flush_now(&self) -> Result<FlushOutcome, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Close the queue, drain it once through the breaker and stop the loop.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.queue.close();
        let (tx, rx) = oneshot::channel();
        let report = match self.commands.send(Command::Shutdown(tx)).await {
            Ok(()) => rx.await.unwrap_or_default(),
            Err(_) => ShutdownReport::default(),
        };

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Batch processor task ended abnormally");
            }
        }
        report
    }
}
