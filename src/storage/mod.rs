// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backing store adapters (the L3 tier and system of record).

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::InMemoryStore;
pub use traits::{BackingStore, BatchEntry, BatchWriteResult, StorageError};
