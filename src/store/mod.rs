#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::command::NewCommand;
use crate::error::StoreError;
use crate::event::{NewEvent, StoreEvent};
use crate::snapshot::{NewSnapshot, SnapshotRecord};
use crate::stream::{StreamDescriptor, StreamRecord};
use crate::{SequenceNumber, XactId};

/// The durable, transactional event store (component B).
///
/// Every write goes through [`commit_events`](Self::commit_events); every
/// other operation here is read-only or housekeeping. Implementations are
/// storage-agnostic at the trait level — [`postgres::PgEventStore`] is the
/// only one shipped in this crate — so that the rest of the crate (the
/// publisher, the repository, the handler dispatch) can be exercised in
/// plain `#[tokio::test]`s without a database.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically writes one command record and every event in `streams`.
    ///
    /// Upserts each [`StreamRecord`] first (creating it on first write for
    /// that `aggregate_id`), then inserts the command, then the events with
    /// `command_record_id` pointing at it. A duplicate
    /// `(aggregate_id, sequence_number)` anywhere in the batch — or
    /// colliding with an already-committed row — surfaces as
    /// [`StoreError::OptimisticLocking`] and leaves no partial state.
    ///
    /// On success, publishes the committed events to the current task's
    /// publisher queue (see [`crate::publisher`]) unless handlers are
    /// globally disabled.
    async fn commit_events(
        &self,
        command: NewCommand,
        streams: Vec<(StreamDescriptor, Vec<NewEvent>)>,
    ) -> Result<Vec<StoreEvent>, StoreError>;

    /// Loads a stream and every event committed after its latest snapshot
    /// (or from sequence 1 if it has none). Returns `Ok(None)` if no stream
    /// exists for `aggregate_id`.
    async fn load_events(&self, aggregate_id: Uuid) -> Result<Option<(StreamRecord, Vec<StoreEvent>)>, StoreError>;

    /// Batched form of [`load_events`](Self::load_events). Aggregates with
    /// no stream are simply absent from the result, not represented as an
    /// error or a `None` slot.
    async fn load_events_for_aggregates(
        &self,
        aggregate_ids: &[Uuid],
    ) -> Result<Vec<(StreamRecord, Vec<StoreEvent>)>, StoreError>;

    /// Fetches a single event row.
    async fn load_event(
        &self,
        aggregate_id: Uuid,
        sequence_number: SequenceNumber,
    ) -> Result<Option<StoreEvent>, StoreError>;

    /// Fetches a single command record by its surrogate id. Useful to
    /// inspect the command that produced a given event via its
    /// `command_record_id`, or to walk a workflow's back-reference
    /// (`event_aggregate_id`/`event_sequence_number`) to the event that
    /// triggered it.
    async fn load_command(&self, command_id: i64) -> Result<Option<crate::command::CommandRecord>, StoreError>;

    /// Streams `(stream, event)` pairs for one aggregate in strictly
    /// increasing `sequence_number` order, optionally filtered to events
    /// committed before `load_until`. Fails eagerly with
    /// [`StoreError::NoEventsForAggregate`] — before yielding anything —
    /// if the window is empty. (The spec's `stream_events_for_aggregate`
    /// is itself synchronous and raises inline; since opening a cursor
    /// requires I/O here, the emptiness check and the stream's
    /// construction are both wrapped in the returned future instead.)
    async fn stream_events_for_aggregate<'s>(
        &'s self,
        aggregate_id: Uuid,
        load_until: Option<DateTime<Utc>>,
    ) -> Result<BoxStream<'s, Result<(StreamRecord, StoreEvent), StoreError>>, StoreError>;

    /// Inserts snapshots and clears `snapshot_outdated_at` on every stream
    /// they cover.
    async fn store_snapshots(&self, snapshots: Vec<NewSnapshot>) -> Result<(), StoreError>;

    /// Loads the most recent snapshot for an aggregate, if any.
    async fn load_latest_snapshot(&self, aggregate_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Sets `snapshot_outdated_at` to now.
    async fn mark_aggregate_for_snapshotting(&self, aggregate_id: Uuid) -> Result<(), StoreError>;

    /// Clears `snapshot_outdated_at`.
    async fn clear_aggregate_for_snapshotting(&self, aggregate_id: Uuid) -> Result<(), StoreError>;

    /// Clears `snapshot_outdated_at` for every stream whose last event was
    /// committed before `before`.
    async fn clear_aggregates_for_snapshotting_with_last_event_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Aggregate ids with a non-null `snapshot_outdated_at`, in id order,
    /// strictly after `last_id`.
    async fn aggregates_that_need_snapshots(
        &self,
        last_id: Option<Uuid>,
        limit: Option<i64>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Same filter, ordered oldest-`snapshot_outdated_at`-first.
    async fn aggregates_that_need_snapshots_ordered_by_priority(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Deletes snapshots strictly below `sequence_number` for `aggregate_id`.
    /// If this removes the aggregate's last remaining snapshot and it still
    /// has events, the aggregate re-enters the needs-snapshot set.
    async fn delete_snapshots_before(
        &self,
        aggregate_id: Uuid,
        sequence_number: SequenceNumber,
    ) -> Result<(), StoreError>;

    /// Deletes every snapshot and re-marks every aggregate that still has
    /// events for snapshotting.
    async fn delete_all_snapshots(&self) -> Result<(), StoreError>;

    /// Permanently deletes a stream and its events. The pre-deletion rows
    /// are preserved in `saved_event_records` with operation `'D'`.
    async fn permanently_delete_event_stream(&self, aggregate_id: Uuid) -> Result<(), StoreError>;

    /// Deletes command records for `aggregate_id` whose referenced events
    /// have all been deleted. A no-op while any of its events still exist.
    async fn permanently_delete_commands_without_events(&self, aggregate_id: Uuid) -> Result<(), StoreError>;

    /// Whether any event exists for `aggregate_id`.
    async fn events_exists(&self, aggregate_id: Uuid) -> Result<bool, StoreError>;

    /// Whether a stream record exists for `aggregate_id`.
    async fn stream_exists(&self, aggregate_id: Uuid) -> Result<bool, StoreError>;

    /// Restart-safe linear scan of every event in the store, ordered by
    /// `xact_id`, dispatched directly to `handlers` in blocks of
    /// `block_size`, bypassing the publisher queue entirely (replay is not
    /// a transactional commit).
    ///
    /// `on_progress(cumulative_count, last_xact_id, last_aggregate_id)` is
    /// invoked once per block; it fires `ceil(total / block_size)` times,
    /// with a monotone non-decreasing `cumulative_count` equal to the total
    /// event count on the last call.
    async fn replay_events_from_cursor<F>(
        &self,
        block_size: u32,
        handlers: &[std::sync::Arc<dyn crate::handler::MessageHandler>],
        on_progress: F,
    ) -> Result<(), StoreError>
    where
        F: Fn(u64, XactId, Uuid) + Send + Sync;
}
