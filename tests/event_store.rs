//! Integration tests for `PgEventStore`, covering the testable properties
//! and end-to-end scenarios of the spec (§8): round-trip fidelity,
//! optimistic locking, replay progress, `load_until` filtering, the
//! snapshot lifecycle, publish failures, partition-key resilience, and the
//! audit/command-cleanup invariants.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use aggregate_store::command::NewCommand;
use aggregate_store::config::Configuration;
use aggregate_store::error::StoreError;
use aggregate_store::event::NewEvent;
use aggregate_store::handler::MessageHandler;
use aggregate_store::store::postgres::PgEventStoreBuilder;
use aggregate_store::store::EventStore;
use aggregate_store::stream::StreamDescriptor;

/// Serializes every test in this file that touches the process-wide
/// [`Configuration`] singleton, since `cargo test` runs them concurrently
/// within one process.
static CONFIG_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

async fn store(pool: Pool<Postgres>) -> aggregate_store::store::postgres::PgEventStore {
    PgEventStoreBuilder::builder()
        .pool(pool)
        .build()
        .try_build()
        .await
        .expect("failed to run migrations / build store")
}

fn new_event(aggregate_id: Uuid, sequence_number: i32, data: &str) -> NewEvent {
    NewEvent::new(aggregate_id, sequence_number, "recorded", json!({ "data": data }))
}

/// S1: round-trips a payload containing characters that would be dangerous
/// if the JSON were ever concatenated into SQL rather than bound as jsonb.
#[sqlx::test]
async fn commit_and_load_round_trips_arbitrary_utf8_payload(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let aggregate_id = Uuid::new_v4();
    let payload = "with ' unsafe SQL characters;\n";

    store
        .commit_events(
            NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
            vec![(
                StreamDescriptor::new(aggregate_id, "widget"),
                vec![new_event(aggregate_id, 1, payload)],
            )],
        )
        .await
        .unwrap();

    let loaded = store.load_event(aggregate_id, 1).await.unwrap().unwrap();
    assert_eq!(loaded.event_json["data"].as_str().unwrap(), payload);
    assert!(loaded.event_json.is_object());

    let command = store.load_command(loaded.command_record_id).await.unwrap().unwrap();
    assert_eq!(command.command_type, "record");
    assert_eq!(command.aggregate_id, Some(aggregate_id));
}

/// `load_command` returns `None` for an id that was never written.
#[sqlx::test]
async fn load_command_returns_none_for_unknown_id(pool: Pool<Postgres>) {
    let store = store(pool).await;
    assert!(store.load_command(i64::MAX).await.unwrap().is_none());
}

/// S2: two events with the same `(aggregate_id, sequence_number)` committed
/// together must fail as a whole, leaving neither row persisted.
#[sqlx::test]
async fn duplicate_sequence_number_in_one_commit_is_an_optimistic_locking_error(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let aggregate_id = Uuid::new_v4();

    store
        .commit_events(
            NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
            vec![(
                StreamDescriptor::new(aggregate_id, "widget"),
                vec![new_event(aggregate_id, 1, "first")],
            )],
        )
        .await
        .unwrap();

    let result = store
        .commit_events(
            NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
            vec![(
                StreamDescriptor::new(aggregate_id, "widget"),
                vec![new_event(aggregate_id, 2, "a"), new_event(aggregate_id, 2, "b")],
            )],
        )
        .await;

    assert!(matches!(result, Err(StoreError::OptimisticLocking { aggregate_id: id, .. }) if id == aggregate_id));

    let (_, events) = store.load_events(aggregate_id).await.unwrap().unwrap();
    assert_eq!(events.len(), 1, "the failed commit must not leave a partial seq=2 row");
}

/// S3: replay dispatches every event exactly once and fires one progress
/// callback per full block plus a final partial one.
#[sqlx::test]
async fn replay_from_cursor_reports_progress_per_block(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let aggregate_id = Uuid::new_v4();

    for seq in 1..=5 {
        store
            .commit_events(
                NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
                vec![(
                    StreamDescriptor::new(aggregate_id, "widget"),
                    vec![new_event(aggregate_id, seq, "x")],
                )],
            )
            .await
            .unwrap();
    }

    let progress: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let progress_clone = progress.clone();
    store
        .replay_events_from_cursor(2, &[], move |cumulative, _xact_id, _aggregate_id| {
            progress_clone.lock().unwrap().push(cumulative);
        })
        .await
        .unwrap();

    assert_eq!(*progress.lock().unwrap(), vec![2, 4, 5]);
}

/// S4: `stream_events_for_aggregate` with `load_until` only yields events
/// committed strictly before that time.
#[sqlx::test]
async fn stream_events_for_aggregate_respects_load_until(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let aggregate_id = Uuid::new_v4();
    let t0 = Utc::now();

    for (seq, offset) in [(1, 0), (2, 5), (3, 10)] {
        let mut event = new_event(aggregate_id, seq, "x");
        event.created_at = t0 + Duration::minutes(offset);
        store
            .commit_events(
                NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
                vec![(StreamDescriptor::new(aggregate_id, "widget"), vec![event])],
            )
            .await
            .unwrap();
    }

    use futures::TryStreamExt;
    let results: Vec<_> = store
        .stream_events_for_aggregate(aggregate_id, Some(t0 + Duration::minutes(1)))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1.sequence_number, 1);
}

/// S5: storing a snapshot clears the needs-snapshot flag; deleting all
/// snapshots re-marks every aggregate that still has events.
#[sqlx::test]
async fn snapshot_lifecycle_tracks_needs_snapshot_set(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let aggregate_id = Uuid::new_v4();

    store
        .commit_events(
            NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
            vec![(
                StreamDescriptor::new(aggregate_id, "widget").mark_snapshot_outdated(),
                vec![new_event(aggregate_id, 1, "x")],
            )],
        )
        .await
        .unwrap();

    let needing = store.aggregates_that_need_snapshots(None, None).await.unwrap();
    assert!(needing.contains(&aggregate_id));

    store
        .store_snapshots(vec![aggregate_store::snapshot::NewSnapshot::new(
            aggregate_id,
            1,
            "widget_snapshot",
            json!({ "count": 1 }),
        )])
        .await
        .unwrap();

    let needing = store.aggregates_that_need_snapshots(None, None).await.unwrap();
    assert!(!needing.contains(&aggregate_id));

    store.delete_all_snapshots().await.unwrap();

    let needing = store.aggregates_that_need_snapshots(None, None).await.unwrap();
    assert!(needing.contains(&aggregate_id), "events still exist, so it must re-enter the set");
}

struct FailingHandler;

#[async_trait]
impl MessageHandler for FailingHandler {
    fn handled_types(&self) -> &'static [&'static str] {
        &["recorded"]
    }

    async fn handle(&self, _event: &aggregate_store::event::StoreEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("Handler error".into())
    }
}

/// S6: a failing handler surfaces as `PublishEventError` naming the handler
/// and the offending event, and aborts the rest of the drain.
#[sqlx::test]
async fn failing_handler_surfaces_as_publish_event_error(pool: Pool<Postgres>) {
    let _guard = CONFIG_LOCK.lock().unwrap();
    let config_snapshot = Configuration::snapshot();
    Configuration::set_event_handlers(vec![Arc::new(FailingHandler)]);

    let store = store(pool).await;
    let aggregate_id = Uuid::new_v4();

    let result = store
        .commit_events(
            NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
            vec![(
                StreamDescriptor::new(aggregate_id, "widget"),
                vec![new_event(aggregate_id, 1, "x")],
            )],
        )
        .await;

    config_snapshot.restore();

    let err = result.unwrap_err();
    match err {
        StoreError::Publish(publish_err) => {
            assert_eq!(publish_err.cause.to_string(), "Handler error");
            assert_eq!(publish_err.aggregate_id, aggregate_id);
            assert_eq!(publish_err.sequence_number, 1);
        }
        other => panic!("expected StoreError::Publish, got {other:?}"),
    }
}

/// Invariant 12: with handlers globally disabled, no callback is invoked.
#[sqlx::test]
async fn disabled_handlers_are_never_invoked(pool: Pool<Postgres>) {
    let _guard = CONFIG_LOCK.lock().unwrap();
    let config_snapshot = Configuration::snapshot();
    Configuration::set_event_handlers(vec![Arc::new(FailingHandler)]);
    Configuration::set_disable_event_handlers(true);

    let store = store(pool).await;
    let aggregate_id = Uuid::new_v4();

    let result = store
        .commit_events(
            NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
            vec![(
                StreamDescriptor::new(aggregate_id, "widget"),
                vec![new_event(aggregate_id, 1, "x")],
            )],
        )
        .await;

    config_snapshot.restore();

    assert!(result.is_ok(), "commit must succeed since the failing handler was never invoked");
}

/// Invariant 7: a reader looping `load_events` must never observe a
/// transient absence while `events_partition_key` is flipped concurrently.
#[sqlx::test]
async fn load_events_is_resilient_to_concurrent_partition_key_flips(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let aggregate_id = Uuid::new_v4();

    store
        .commit_events(
            NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
            vec![(
                StreamDescriptor::new(aggregate_id, "widget"),
                vec![new_event(aggregate_id, 1, "x")],
            )],
        )
        .await
        .unwrap();

    const FLIPS: usize = 200;
    let writer_store = store.clone();
    let writer = tokio::spawn(async move {
        for i in 0..FLIPS {
            let key = if i % 2 == 0 { "partition_a" } else { "partition_b" };
            writer_store
                .commit_events(
                    NewCommand::new("repartition", json!({})).for_aggregate(aggregate_id),
                    vec![(StreamDescriptor::new(aggregate_id, "widget").with_partition_key(key), vec![])],
                )
                .await
                .unwrap();
        }
    });

    let reader_store = store.clone();
    let null_reads = Arc::new(AtomicUsize::new(0));
    let null_reads_clone = null_reads.clone();
    let reader = tokio::spawn(async move {
        for _ in 0..FLIPS {
            if reader_store.load_events(aggregate_id).await.unwrap().is_none() {
                null_reads_clone.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let _ = tokio::join!(writer, reader);

    assert_eq!(null_reads.load(Ordering::SeqCst), 0);
}

/// Invariant 10: deleting a stream preserves its events in
/// `saved_event_records` with operation `'D'`.
#[sqlx::test]
async fn permanently_deleting_a_stream_preserves_an_audit_trail(pool: Pool<Postgres>) {
    let store = store(pool.clone()).await;
    let aggregate_id = Uuid::new_v4();

    store
        .commit_events(
            NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
            vec![(
                StreamDescriptor::new(aggregate_id, "widget"),
                vec![new_event(aggregate_id, 1, "keep me")],
            )],
        )
        .await
        .unwrap();

    store.permanently_delete_event_stream(aggregate_id).await.unwrap();

    assert!(!store.events_exists(aggregate_id).await.unwrap());
    assert!(!store.stream_exists(aggregate_id).await.unwrap());

    let row = sqlx::query("SELECT event_json, operation FROM saved_event_records WHERE aggregate_id = $1")
        .bind(aggregate_id)
        .fetch_one(&pool)
        .await
        .unwrap();

    let operation: String = row.try_get("operation").unwrap();
    let event_json: Value = row.try_get("event_json").unwrap();
    assert_eq!(operation, "D");
    assert_eq!(event_json["data"].as_str().unwrap(), "keep me");
}

/// Invariant 11: command cleanup is a no-op while events exist, and removes
/// the command once its events are gone.
#[sqlx::test]
async fn commands_without_events_are_cleaned_up_only_after_events_are_deleted(pool: Pool<Postgres>) {
    let store = store(pool.clone()).await;
    let aggregate_id = Uuid::new_v4();

    store
        .commit_events(
            NewCommand::new("record", json!({})).for_aggregate(aggregate_id),
            vec![(
                StreamDescriptor::new(aggregate_id, "widget"),
                vec![new_event(aggregate_id, 1, "x")],
            )],
        )
        .await
        .unwrap();

    store.permanently_delete_commands_without_events(aggregate_id).await.unwrap();
    assert!(store.events_exists(aggregate_id).await.unwrap(), "no-op while events still exist");
    let (before,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM command_records WHERE aggregate_id = $1")
        .bind(aggregate_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(before, 1, "cleanup must be a no-op while the command's events still exist");

    store.permanently_delete_event_stream(aggregate_id).await.unwrap();
    store.permanently_delete_commands_without_events(aggregate_id).await.unwrap();

    let (remaining,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM command_records WHERE aggregate_id = $1")
        .bind(aggregate_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}
