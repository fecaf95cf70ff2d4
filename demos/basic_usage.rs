// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic timecard-engine usage example.
//!
//! Demonstrates:
//! 1. Starting the engine (Redis if `TIMECARD_REDIS_URL` is set, memory otherwise)
//! 2. Clocking a few users in and out, with a manual clock standing in for time
//! 3. Adding and archiving a custom category
//! 4. Reading history and per-category totals
//! 5. Health snapshot and raw metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! TIMECARD_REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use timecard_engine::storage::redis::RedisStore;
use timecard_engine::{BackingStore, EngineState, InMemoryStore, ManualClock, NewCategory, TimecardConfig, TimecardEngine};
use tracing_subscriber::EnvFilter;

const SERVER: u64 = 1001;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           timecard-engine: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let redis_url = std::env::var("TIMECARD_REDIS_URL").ok();
    let config = TimecardConfig {
        redis_url: redis_url.clone(),
        redis_prefix: Some("timecard-demo:".into()),
        // Flush quickly for the demo
        batch_critical_latency_ms: 50,
        batch_max_flush_interval_ms: 500,
        health_report_interval_secs: 0,
        ..Default::default()
    };

    let store: Arc<dyn BackingStore> = match &redis_url {
        Some(url) => {
            println!("📦 Backing store: Redis at {}", url);
            Arc::new(RedisStore::with_prefix(url, config.redis_prefix.as_deref()).await?)
        }
        None => {
            println!("📦 Backing store: in-memory (set TIMECARD_REDIS_URL for Redis)");
            Arc::new(InMemoryStore::new())
        }
    };

    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let engine = TimecardEngine::start_with_clock(config, store, clock.clone()).await?;
    assert_eq!(engine.state(), EngineState::Running);
    println!("   ✅ Engine running");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. A working day for three users
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⏱️  Clocking in three users...");
    for (user, category) in [(1, "work"), (2, "meeting"), (3, "development")] {
        let started = std::time::Instant::now();
        let session = engine.clock_in(user, SERVER, category).await?;
        println!(
            "   └─ user {} → {} (session {}, {:?})",
            user,
            category,
            session.session_id,
            started.elapsed()
        );
    }

    match engine.clock_in(1, SERVER, "break").await {
        Ok(_) => println!("   ⚠️  Second clock-in unexpectedly succeeded"),
        Err(e) => println!("   └─ user 1 again → refused: {}", e),
    }

    clock.advance(Duration::from_secs(45 * 60));
    println!("\n🕐 45 minutes later...");
    let archived = engine.clock_out(2, SERVER).await?;
    println!("   └─ user 2 clocked out after {}s", archived.accumulated_seconds);

    clock.advance(Duration::from_secs(75 * 60));
    println!("🕑 Another 75 minutes...");
    let archived = engine.force_clock_out(99, 3, SERVER).await?;
    println!(
        "   └─ user 3 force-closed by admin after {}s ({:?})",
        archived.accumulated_seconds, archived.closed_by
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Custom categories
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🏷️  Categories...");
    let research = engine
        .add_category(
            SERVER,
            NewCategory {
                productivity_weight: Some(1.5),
                ..NewCategory::named("Research")
            },
        )
        .await?;
    println!("   └─ added '{}' colour {} weight {}", research.name, research.color, research.productivity_weight);

    engine.clock_in(2, SERVER, "research").await?;
    clock.advance(Duration::from_secs(30 * 60));
    engine.clock_out(2, SERVER).await?;

    engine.archive_category(SERVER, "research").await?;
    match engine.clock_in(2, SERVER, "research").await {
        Ok(_) => println!("   ⚠️  Archived category still accepted"),
        Err(e) => println!("   └─ archived category refused: {}", e),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. History and totals
    // ─────────────────────────────────────────────────────────────────────────
    engine.clock_out(1, SERVER).await?;
    println!("\n📖 History for user 2:");
    for session in engine.recent_sessions(2, SERVER).await? {
        println!("   └─ {} {}s", session.category, session.accumulated_seconds);
    }
    let totals = engine.user_totals(2, SERVER).await?;
    println!("   Total: {}s over {} sessions", totals.total_seconds, totals.sessions);
    for (category, total) in &totals.by_category {
        println!("   └─ {}: {}s", category, total.seconds);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let outcome = engine.flush().await?;
    println!("\n💾 Flushed {} writes ({} keys)", outcome.persisted, outcome.keys);

    let snapshot = engine.get_health_snapshot();
    engine.health().publish(&snapshot);
    println!("\n🩺 Health: {}", snapshot.status);
    println!("   ├─ Queue depth: {} ({})", snapshot.queue.depth, snapshot.queue.backpressure);
    println!("   ├─ Circuit: {}", snapshot.circuit.state);
    println!(
        "   ├─ Cache: L1 {} / L2 {} entries, hit rate {:.1}%",
        snapshot.cache.l1.size,
        snapshot.cache.l2.size,
        snapshot.cache.hit_rate * 100.0
    );
    println!(
        "   └─ Latency: p50 {:.3}ms p99 {:.3}ms over {} ops",
        snapshot.latency.p50_ms, snapshot.latency.p99_ms, snapshot.latency.count
    );

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    let report = engine.shutdown().await;
    println!(
        "   ✅ {} (persisted {}, unpersisted {})",
        engine.state(),
        report.persisted,
        report.unpersisted.len()
    );

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print captured metrics grouped by kind, sorted by name
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<(u8, String)> = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<String> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let name = if labels.is_empty() {
            key.name().to_string()
        } else {
            format!("{}{{{}}}", key.name(), labels.join(","))
        };

        match value {
            DebugValue::Counter(v) => lines.push((0, format!("counter   {} = {}", name, v))),
            DebugValue::Gauge(v) => lines.push((1, format!("gauge     {} = {:.3}", name, v.into_inner()))),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(0.0, f64::max);
                lines.push((
                    2,
                    format!("histogram {} count={} sum={:.4} max={:.4}", name, count, sum, max),
                ));
            }
        }
    }

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
        return;
    }
    lines.sort();
    for (_, line) in lines {
        println!("   └─ {}", line);
    }
}
