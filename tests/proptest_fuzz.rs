// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests (fuzzing) for the timecard engine.
//!
//! Uses proptest to generate random inputs and verify that validation never
//! panics, the queue never exceeds its bound, coalescing keeps the newest
//! write and the cache always returns what was last written.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use proptest::prelude::*;

use timecard_engine::batching::{BatchOperation, BatchQueue, Priority, QueueConfig, WriteKind};
use timecard_engine::cache::{CacheConfig, CacheHierarchy, WriteOptions};
use timecard_engine::category::types::derive_color;
use timecard_engine::category::RESERVED_NAMES;
use timecard_engine::{
    ArchivedSession, CategoryConfig, CircuitBreaker, CircuitConfig, EngineError, InMemoryStore, NewCategory, Session,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Critical),
        Just(Priority::Normal),
        Just(Priority::Background),
    ]
}

/// Category names: mostly plausible, sometimes hostile.
fn category_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z0-9 _-]{0,60}",
        ".{0,80}",
        prop::sample::select(RESERVED_NAMES.to_vec()).prop_map(|s| s.to_uppercase()),
    ]
}

fn is_hex_color(color: &str) -> bool {
    color.len() == 7 && color.starts_with('#') && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Deserialization Fuzz Tests
// =============================================================================

proptest! {
    /// Stored records decode to an error, never a panic
    #[test]
    fn fuzz_records_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let _ = serde_json::from_slice::<Session>(&bytes);
        let _ = serde_json::from_slice::<ArchivedSession>(&bytes);
        let _ = serde_json::from_slice::<CategoryConfig>(&bytes);
    }

    /// Corrupt cached bytes surface as `Corrupt`, not a panic
    #[test]
    fn fuzz_cache_decode_reports_corruption(bytes in prop::collection::vec(any::<u8>(), 1..512)) {
        let result = timecard_engine::cache::decode::<Session>("session:1:1", &bytes);
        if let Err(err) = result {
            let is_corrupt = matches!(err, EngineError::Corrupt { .. });
            prop_assert!(is_corrupt);
        }
    }
}

// =============================================================================
// Category Validation
// =============================================================================

proptest! {
    /// Accepted categories always satisfy the naming rules
    #[test]
    fn prop_valid_category_names(name in category_name_strategy()) {
        if let Ok(category) = NewCategory::named(name.clone()).validate() {
            prop_assert!(!category.name.is_empty());
            prop_assert!(category.name.chars().count() <= 50);
            prop_assert!(category
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_'));
            prop_assert!(!category.name.chars().any(|c| c.is_ascii_uppercase()));
            prop_assert!(!RESERVED_NAMES.contains(&category.name.as_str()));
            prop_assert!(is_hex_color(&category.color));
            prop_assert_eq!(category.productivity_weight, 1.0);
        }
    }

    /// Weights outside 0..=5 are always refused
    #[test]
    fn prop_weight_bounds(weight in -10.0f64..10.0) {
        let result = NewCategory {
            productivity_weight: Some(weight),
            ..NewCategory::named("focus")
        }
        .validate();
        prop_assert_eq!(result.is_ok(), (0.0..=5.0).contains(&weight));
    }

    /// Derived colours are valid, stable and readable
    #[test]
    fn prop_derived_color(name in "[a-z0-9 _-]{1,50}") {
        let color = derive_color(&name);
        prop_assert!(is_hex_color(&color));
        prop_assert_eq!(&color, &derive_color(&name));

        let channels: Vec<u32> = (0..3)
            .map(|i| u32::from_str_radix(&color[1 + 2 * i..3 + 2 * i], 16).unwrap())
            .collect();
        // A dark hash is lifted by 64 per channel, so the average ends up >= 64
        prop_assert!(channels.iter().sum::<u32>() / 3 >= 64);
    }
}

// =============================================================================
// Queue Invariants
// =============================================================================

proptest! {
    /// Depth never exceeds capacity and rejected batches leave no trace
    #[test]
    fn prop_queue_bounded(
        batches in prop::collection::vec(
            (prop::collection::vec(priority_strategy(), 1..5), 0u8..20),
            1..60,
        )
    ) {
        let capacity = 25;
        let queue = BatchQueue::new(QueueConfig { capacity, ..QueueConfig::default() });
        let mut accepted = 0usize;
        let mut seq = 0u64;

        for (priorities, key) in batches {
            let ops: Vec<BatchOperation> = priorities
                .iter()
                .map(|p| {
                    seq += 1;
                    BatchOperation::set(format!("k{}", key), Arc::from(&b"v"[..]), None, *p, "fuzz", seq)
                })
                .collect();
            let len = ops.len();
            let before = queue.depth();
            match queue.enqueue_all(ops) {
                Ok(()) => accepted += len,
                Err(EngineError::Overloaded { .. }) => prop_assert_eq!(queue.depth(), before),
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
            prop_assert!(queue.depth() <= capacity);
        }
        prop_assert_eq!(queue.depth(), accepted);
    }

    /// A batch carries one value write per key, and it is the newest one
    #[test]
    fn prop_coalescing_keeps_newest(writes in prop::collection::vec((0u8..6, any::<u16>()), 1..80)) {
        let queue = BatchQueue::new(QueueConfig::default());
        let mut newest: HashMap<String, (u64, u16)> = HashMap::new();

        for (seq, (key, value)) in writes.into_iter().enumerate() {
            let key = format!("k{}", key);
            let seq = seq as u64 + 1;
            let op = BatchOperation::set(
                key.clone(),
                Arc::from(value.to_be_bytes().as_slice()),
                None,
                Priority::Normal,
                "fuzz",
                seq,
            );
            queue.enqueue(op).unwrap();
            newest.insert(key, (seq, value));
        }

        let batch = queue.take_batch(Instant::now(), false);
        prop_assert_eq!(batch.len(), newest.len());
        prop_assert!(queue.is_empty());
        for writes in batch {
            let set = writes.set.expect("every key had a value write");
            let (seq, value) = newest[&writes.key];
            prop_assert_eq!(set.seq, seq);
            match set.kind {
                WriteKind::Set { value: bytes, .. } => prop_assert_eq!(&bytes[..], &value.to_be_bytes()[..]),
                WriteKind::Expire { .. } => prop_assert!(false, "expected a value write"),
            }
        }
    }
}

// =============================================================================
// Cache Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever tier a key ends up in, reads return the last accepted write
    #[test]
    fn prop_cache_read_your_writes(
        ops in prop::collection::vec((0u8..8, any::<u32>(), any::<bool>()), 1..120)
    ) {
        let runtime = rt();
        let queue = Arc::new(BatchQueue::new(QueueConfig::default()));
        let cache = CacheHierarchy::new(
            CacheConfig {
                l1_capacity: 2,
                l2_capacity: 8,
                promotion_threshold: 0,
                ..CacheConfig::default()
            },
            Arc::new(InMemoryStore::new()),
            Arc::new(CircuitBreaker::new("fuzz", CircuitConfig::default())),
            queue,
        );

        let mut expected: HashMap<String, u32> = HashMap::new();
        for (key, value, hot) in ops {
            let key = format!("k{}", key);
            let options = if hot {
                WriteOptions::hot(Priority::Normal, "fuzz")
            } else {
                WriteOptions::warm(Priority::Normal, "fuzz")
            };
            cache.put(&key, Arc::from(value.to_be_bytes().as_slice()), options).unwrap();
            expected.insert(key.clone(), value);

            let read = runtime.block_on(cache.get(&key)).unwrap();
            prop_assert_eq!(read.as_deref(), Some(&value.to_be_bytes()[..]));
        }

        for (key, value) in expected {
            let read = runtime.block_on(cache.get(&key)).unwrap();
            prop_assert_eq!(read.as_deref(), Some(&value.to_be_bytes()[..]));
            prop_assert!(cache.is_dirty(&key));
        }
    }
}
