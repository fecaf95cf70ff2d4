// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end session flows through the public engine API.
//!
//! Everything here runs against the in-memory store with a manual clock, so
//! durations are exact and no external services are needed.
//!
//! ```bash
//! cargo test --test session_flow
//! ```

use std::sync::Arc;
use std::time::Duration;

use timecard_engine::session::keys;
use timecard_engine::{
    ArchivedSession, BackingStore, CategoryRemoval, CloseReason, EngineError, EngineState, HealthStatus, InMemoryStore,
    ManualClock, NewCategory, ServerTotals, Session, SessionState, TimecardConfig, TimecardEngine, ValidationError,
};

const USER: u64 = 42;
const SERVER: u64 = 7;
const START_SECS: i64 = 1_700_000_000;

fn test_config() -> TimecardConfig {
    TimecardConfig {
        health_report_interval_secs: 0,
        batch_max_flush_interval_ms: 50,
        batch_critical_latency_ms: 10,
        ..Default::default()
    }
}

async fn engine_with(config: TimecardConfig) -> (TimecardEngine, Arc<InMemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::at_secs(START_SECS));
    let engine = TimecardEngine::start_with_clock(config, store.clone(), clock.clone())
        .await
        .expect("engine should start");
    (engine, store, clock)
}

async fn engine() -> (TimecardEngine, Arc<InMemoryStore>, Arc<ManualClock>) {
    engine_with(test_config()).await
}

async fn stored<T: serde::de::DeserializeOwned>(store: &InMemoryStore, key: &str) -> Option<T> {
    store
        .get(key)
        .await
        .expect("memory store never fails")
        .map(|bytes| serde_json::from_slice(&bytes).expect("stored value should decode"))
}

// =============================================================================
// Clock in / clock out
// =============================================================================

#[tokio::test]
async fn test_hour_long_session_is_archived_with_exact_duration() {
    let (engine, _store, clock) = engine().await;

    let session = engine.clock_in(USER, SERVER, "work").await.unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.start_timestamp, START_SECS * 1000);

    clock.advance(Duration::from_secs(3600));
    let archived = engine.clock_out(USER, SERVER).await.unwrap();

    assert_eq!(archived.session_id, session.session_id);
    assert_eq!(archived.accumulated_seconds, 3600);
    assert_eq!(archived.end_timestamp, (START_SECS + 3600) * 1000);
    assert_eq!(archived.state, SessionState::Archived);
    assert_eq!(archived.closed_by, CloseReason::User);
    assert!(!archived.capped);

    assert!(engine.get_status(USER, SERVER).await.unwrap().is_none());

    let next = engine.clock_in(USER, SERVER, "break").await.unwrap();
    assert_ne!(next.session_id, session.session_id);
    assert_eq!(next.accumulated_seconds, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_status_is_visible_before_any_flush() {
    let (engine, store, _clock) = engine().await;

    let session = engine.clock_in(USER, SERVER, "meeting").await.unwrap();
    let status = engine.get_status(USER, SERVER).await.unwrap();
    assert_eq!(status, Some(session));

    engine.shutdown().await;
    assert!(stored::<Session>(&store, &keys::active(SERVER, USER)).await.is_some());
}

#[tokio::test]
async fn test_second_clock_in_conflicts() {
    let (engine, _store, _clock) = engine().await;

    let first = engine.clock_in(USER, SERVER, "work").await.unwrap();
    let err = engine.clock_in(USER, SERVER, "break").await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyActive { user_id: USER, server_id: SERVER }));

    // Existing session untouched
    let status = engine.get_status(USER, SERVER).await.unwrap().unwrap();
    assert_eq!(status.session_id, first.session_id);
    assert_eq!(status.category, "work");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_pairs_are_independent() {
    let (engine, _store, _clock) = engine().await;

    engine.clock_in(USER, SERVER, "work").await.unwrap();
    engine.clock_in(USER, SERVER + 1, "work").await.unwrap();
    engine.clock_in(USER + 1, SERVER, "work").await.unwrap();

    engine.clock_out(USER, SERVER).await.unwrap();
    assert!(engine.get_status(USER, SERVER + 1).await.unwrap().is_some());
    assert!(engine.get_status(USER + 1, SERVER).await.unwrap().is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_clock_out_without_session() {
    let (engine, _store, _clock) = engine().await;

    let err = engine.clock_out(USER, SERVER).await.unwrap_err();
    assert!(matches!(err, EngineError::NoActiveSession { .. }));

    engine.clock_in(USER, SERVER, "work").await.unwrap();
    engine.clock_out(USER, SERVER).await.unwrap();
    let err = engine.clock_out(USER, SERVER).await.unwrap_err();
    assert!(matches!(err, EngineError::NoActiveSession { .. }));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_force_clock_out_records_admin() {
    let (engine, _store, clock) = engine().await;

    engine.clock_in(USER, SERVER, "support").await.unwrap();
    clock.advance(Duration::from_secs(90));
    let archived = engine.force_clock_out(1, USER, SERVER).await.unwrap();

    assert_eq!(archived.closed_by, CloseReason::Admin { admin_id: 1 });
    assert_eq!(archived.accumulated_seconds, 90);
    assert!(engine.get_status(USER, SERVER).await.unwrap().is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_overlong_session_is_capped() {
    let config = TimecardConfig {
        max_session_secs: 600,
        ..test_config()
    };
    let (engine, _store, clock) = engine_with(config).await;

    engine.clock_in(USER, SERVER, "work").await.unwrap();
    clock.advance(Duration::from_secs(5_000));
    let archived = engine.clock_out(USER, SERVER).await.unwrap();

    assert!(archived.capped);
    assert_eq!(archived.accumulated_seconds, 600);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_clock_ins_admit_exactly_one() {
    let (engine, _store, _clock) = engine().await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..32 {
        let engine = engine.clone();
        let category = if i % 2 == 0 { "work" } else { "break" };
        handles.push(tokio::spawn(async move { engine.clock_in(USER, SERVER, category).await }));
    }

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::AlreadyActive { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(admitted, 1);

    engine.shutdown().await;
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_close_persists_archive_and_idle_slot() {
    let (engine, store, clock) = engine().await;

    engine.clock_in(USER, SERVER, "development").await.unwrap();
    clock.advance(Duration::from_secs(1800));
    let archived = engine.clock_out(USER, SERVER).await.unwrap();

    let outcome = engine.flush().await.unwrap();
    assert!(outcome.is_clean());

    let archive_key = keys::archive(SERVER, USER, archived.session_id);
    let persisted: ArchivedSession = stored(&store, &archive_key).await.unwrap();
    assert_eq!(persisted, archived);
    let ttl = store.ttl_of(&archive_key).unwrap();
    assert!(ttl > Duration::from_secs(29 * 86_400));

    let slot: Session = stored(&store, &keys::active(SERVER, USER)).await.unwrap();
    assert_eq!(slot.state, SessionState::Idle);

    // Acknowledged writes are no longer pinned
    assert!(!engine.cache().is_dirty(&archive_key));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_open_session_survives_restart() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::at_secs(START_SECS));

    let first = TimecardEngine::start_with_clock(test_config(), store.clone(), clock.clone())
        .await
        .unwrap();
    let session = first.clock_in(USER, SERVER, "work").await.unwrap();
    let report = first.shutdown().await;
    assert!(report.unpersisted.is_empty());
    assert!(report.persisted >= 1);

    let second = TimecardEngine::start_with_clock(test_config(), store.clone(), clock.clone())
        .await
        .unwrap();
    let status = second.get_status(USER, SERVER).await.unwrap();
    assert_eq!(status, Some(session.clone()));

    let err = second.clock_in(USER, SERVER, "break").await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyActive { .. }));

    clock.advance(Duration::from_secs(120));
    let archived = second.clock_out(USER, SERVER).await.unwrap();
    assert_eq!(archived.session_id, session.session_id);
    assert_eq!(archived.accumulated_seconds, 120);

    second.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_refreshes_store_ttl() {
    let config = TimecardConfig {
        active_session_ttl_secs: 600,
        ..test_config()
    };
    let (engine, store, _clock) = engine_with(config).await;

    assert!(matches!(
        engine.heartbeat(USER, SERVER).await,
        Err(EngineError::NoActiveSession { .. })
    ));

    engine.clock_in(USER, SERVER, "work").await.unwrap();
    engine.flush().await.unwrap();
    assert!(engine.heartbeat(USER, SERVER).await.unwrap());
    engine.flush().await.unwrap();

    let ttl = store.ttl_of(&keys::active(SERVER, USER)).unwrap();
    assert!(ttl > Duration::from_secs(590));

    engine.shutdown().await;
}

// =============================================================================
// History
// =============================================================================

#[tokio::test]
async fn test_history_and_totals_accumulate() {
    let (engine, _store, clock) = engine().await;

    for (category, secs) in [("work", 600), ("break", 60), ("work", 900)] {
        engine.clock_in(USER, SERVER, category).await.unwrap();
        clock.advance(Duration::from_secs(secs));
        engine.clock_out(USER, SERVER).await.unwrap();
    }

    let recent = engine.recent_sessions(USER, SERVER).await.unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].accumulated_seconds, 900, "newest first");

    let totals = engine.user_totals(USER, SERVER).await.unwrap();
    assert_eq!(totals.total_seconds, 1560);
    assert_eq!(totals.sessions, 3);
    assert_eq!(totals.by_category["work"].seconds, 1500);
    assert_eq!(totals.by_category["work"].sessions, 2);
    assert_eq!(totals.by_category["break"].seconds, 60);

    let history = engine.history();
    assert_eq!(history.user_totals(USER, SERVER).await.unwrap(), totals);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_server_totals_span_users_and_manual_entries() {
    let (engine, store, clock) = engine().await;

    for user in [1, 2] {
        engine.clock_in(user, SERVER, "work").await.unwrap();
    }
    clock.advance(Duration::from_secs(600));
    for user in [1, 2] {
        engine.clock_out(user, SERVER).await.unwrap();
    }
    let manual = engine.add_time(3, SERVER, "meeting", 1_800).await.unwrap();
    assert_eq!(manual.closed_by, CloseReason::Manual);
    assert_eq!(manual.end_timestamp, (START_SECS + 600) * 1000);

    let server = engine.server_totals(SERVER).await.unwrap();
    assert_eq!(server.total_seconds, 3_000);
    assert_eq!(server.sessions, 3);
    assert_eq!(server.by_category["work"].seconds, 1_200);
    assert_eq!(server.by_category["meeting"].seconds, 1_800);

    let user = engine.user_totals(3, SERVER).await.unwrap();
    assert_eq!(user.total_seconds, 1_800);
    assert_eq!(engine.recent_sessions(3, SERVER).await.unwrap(), vec![manual.clone()]);

    assert!(engine.flush().await.unwrap().is_clean());
    let persisted: ServerTotals = stored(&store, &keys::server_totals(SERVER)).await.unwrap();
    assert_eq!(persisted, server);
    let archive: ArchivedSession = stored(&store, &keys::archive(SERVER, 3, manual.session_id)).await.unwrap();
    assert_eq!(archive, manual);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_manual_time_is_validated() {
    let (engine, _store, _clock) = engine().await;

    for seconds in [0, 86_401] {
        let err = engine.add_time(USER, SERVER, "work", seconds).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::InvalidDuration { .. })
        ));
    }
    let err = engine.add_time(USER, SERVER, "gaming", 60).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UnknownCategory { .. })
    ));
    assert_eq!(engine.server_totals(SERVER).await.unwrap().sessions, 0);

    engine.shutdown().await;
    assert_eq!(
        engine.add_time(USER, SERVER, "work", 60).await.unwrap_err(),
        EngineError::ShuttingDown
    );
}

#[tokio::test]
async fn test_unknown_user_has_empty_history() {
    let (engine, _store, _clock) = engine().await;

    assert!(engine.recent_sessions(99, SERVER).await.unwrap().is_empty());
    let totals = engine.user_totals(99, SERVER).await.unwrap();
    assert_eq!(totals.total_seconds, 0);
    assert!(totals.by_category.is_empty());

    engine.shutdown().await;
}

// =============================================================================
// Categories
// =============================================================================

#[tokio::test]
async fn test_default_categories_without_configuration() {
    let (engine, _store, _clock) = engine().await;

    let config = engine.get_category_config(SERVER).await.unwrap();
    assert_eq!(config.server_id, SERVER);
    assert!(config.find("work").is_some());
    assert!(config.categories.iter().all(|c| !c.archived));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_category_lifecycle_gates_clock_in() {
    let (engine, _store, _clock) = engine().await;

    let err = engine.clock_in(USER, SERVER, "research").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UnknownCategory { .. })
    ));

    let added = engine
        .add_category(SERVER, NewCategory::named("Research"))
        .await
        .unwrap();
    assert_eq!(added.name, "research");
    assert_eq!(added.description, "Time tracking for research");
    assert!(added.color.starts_with('#'));

    engine.clock_in(USER, SERVER, "research").await.unwrap();
    engine.clock_out(USER, SERVER).await.unwrap();

    engine.archive_category(SERVER, "research").await.unwrap();
    let err = engine.clock_in(USER, SERVER, "research").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UnknownCategory { .. })
    ));

    // Archived categories keep their history and can come back
    assert!(engine.get_category_config(SERVER).await.unwrap().find("research").is_some());
    engine.restore_category(SERVER, "research").await.unwrap();
    engine.clock_in(USER, SERVER, "research").await.unwrap();

    engine.shutdown().await;
}

#[tokio::test]
async fn test_remove_category_deletes_unused_and_archives_used() {
    let (engine, _store, _clock) = engine().await;

    engine.add_category(SERVER, NewCategory::named("Research")).await.unwrap();
    engine.add_category(SERVER, NewCategory::named("Ops")).await.unwrap();
    engine.add_time(USER, SERVER, "research", 900).await.unwrap();

    let used = engine.remove_category(SERVER, "research").await.unwrap();
    assert!(matches!(used, CategoryRemoval::Archived(ref c) if c.archived));
    let unused = engine.remove_category(SERVER, "ops").await.unwrap();
    assert!(matches!(unused, CategoryRemoval::Deleted(_)));

    let active: Vec<String> = engine
        .list_categories(SERVER, false)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert!(!active.contains(&"research".to_string()));
    assert!(!active.contains(&"ops".to_string()));
    let mut sorted = active.clone();
    sorted.sort();
    assert_eq!(active, sorted);

    let all = engine.list_categories(SERVER, true).await.unwrap();
    assert!(all.iter().any(|c| c.name == "research" && c.archived));
    assert!(all.iter().all(|c| c.name != "ops"));

    // History recorded against the archived category is still readable
    let totals = engine.user_totals(USER, SERVER).await.unwrap();
    assert_eq!(totals.by_category["research"].seconds, 900);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_invalid_categories_rejected() {
    let (engine, _store, _clock) = engine().await;

    let reserved = engine.add_category(SERVER, NewCategory::named("total")).await;
    assert!(matches!(
        reserved,
        Err(EngineError::Validation(ValidationError::ReservedName(_)))
    ));

    let duplicate = engine.add_category(SERVER, NewCategory::named("Work")).await;
    assert!(matches!(
        duplicate,
        Err(EngineError::Validation(ValidationError::DuplicateCategory(_)))
    ));

    let bad_color = engine
        .add_category(
            SERVER,
            NewCategory {
                color: Some("red".into()),
                ..NewCategory::named("ops")
            },
        )
        .await;
    assert!(matches!(
        bad_color,
        Err(EngineError::Validation(ValidationError::InvalidColor(_)))
    ));

    engine.shutdown().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_shutdown_refuses_writes_and_is_idempotent() {
    let (engine, store, _clock) = engine().await;
    let mut state = engine.state_receiver();

    engine.clock_in(USER, SERVER, "work").await.unwrap();
    let report = engine.shutdown().await;
    assert!(report.unpersisted.is_empty());
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(*state.borrow_and_update(), EngineState::Stopped);
    assert!(!store.is_empty());

    let err = engine.clock_out(USER, SERVER).await.unwrap_err();
    assert!(matches!(err, EngineError::ShuttingDown));

    let again = engine.shutdown().await;
    assert_eq!(again.persisted, 0);
    assert!(again.unpersisted.is_empty());
}

#[tokio::test]
async fn test_invalid_config_refused() {
    let config = TimecardConfig {
        l1_capacity: 0,
        ..test_config()
    };
    let result = TimecardEngine::start(config, Arc::new(InMemoryStore::new())).await;
    assert!(matches!(result, Err(EngineError::Config(_))));
}

#[tokio::test]
async fn test_fresh_engine_reports_healthy() {
    let (engine, _store, _clock) = engine().await;

    engine.clock_in(USER, SERVER, "work").await.unwrap();
    let snapshot = engine.get_health_snapshot();
    assert_eq!(snapshot.status, HealthStatus::Healthy);
    assert!(snapshot.latency.count >= 1);

    engine.shutdown().await;
}
