// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind batching.
//!
//! Producers push [`BatchOperation`]s into the [`BatchQueue`]; one
//! [`BatchProcessor`] task drains it, flushing when the ready count reaches
//! a threshold, when the oldest critical write has waited out its latency
//! budget, or when the maximum interval elapses, whichever comes first.

pub mod operation;
pub mod processor;
pub mod queue;

pub use operation::{BatchOperation, DeadLetter, Priority, WriteKind};
pub use processor::{BatchProcessor, FlushObserver, FlushOutcome, ProcessorHandle, ShutdownReport};
pub use queue::{BatchQueue, FlushReason, KeyWrites, QueueConfig, QueueStats};
