use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use sqlx::{Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::command::NewCommand;
use crate::error::StoreError;
use crate::event::{NewEvent, StoreEvent};
use crate::handler::MessageHandler;
use crate::snapshot::{NewSnapshot, SnapshotRecord};
use crate::stream::{SnapshotOutdated, StreamDescriptor, StreamRecord, DEFAULT_PARTITION_KEY};
use crate::{config::Configuration, SequenceNumber, XactId};

use super::records::EventRow;

/// Postgres-backed [`crate::store::EventStore`].
///
/// Cheaply cloneable: internally just an `sqlx::Pool`, which is itself an
/// `Arc` around a connection pool.
#[derive(Clone)]
pub struct PgEventStore {
    pool: Pool<Postgres>,
}

impl PgEventStore {
    pub(super) fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Creates or updates the `stream_records` row for one of the streams
    /// targeted by a `commit_events` call. Must run inside the same
    /// transaction as the event inserts, before them, so that the stream's
    /// `aggregate_id` exists to satisfy the event rows' foreign key.
    async fn upsert_stream(
        &self,
        transaction: &mut Transaction<'_, Postgres>,
        descriptor: &StreamDescriptor,
    ) -> Result<(), StoreError> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT aggregate_type FROM stream_records WHERE aggregate_id = $1 FOR UPDATE")
                .bind(descriptor.aggregate_id)
                .fetch_optional(&mut **transaction)
                .await?;

        if existing.is_none() {
            let partition_key = descriptor
                .events_partition_key
                .clone()
                .unwrap_or_else(|| DEFAULT_PARTITION_KEY.to_string());
            let snapshot_outdated_at: Option<DateTime<Utc>> =
                matches!(descriptor.snapshot_outdated, Some(SnapshotOutdated::Mark)).then(Utc::now);

            sqlx::query(
                "INSERT INTO stream_records \
                 (aggregate_id, aggregate_type, snapshot_threshold, events_partition_key, snapshot_outdated_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(descriptor.aggregate_id)
            .bind(&descriptor.aggregate_type)
            .bind(descriptor.snapshot_threshold)
            .bind(partition_key)
            .bind(snapshot_outdated_at)
            .execute(&mut **transaction)
            .await?;

            return Ok(());
        }

        if let Some(key) = &descriptor.events_partition_key {
            sqlx::query("UPDATE stream_records SET events_partition_key = $2 WHERE aggregate_id = $1")
                .bind(descriptor.aggregate_id)
                .bind(key)
                .execute(&mut **transaction)
                .await?;
        }

        match descriptor.snapshot_outdated {
            Some(SnapshotOutdated::Mark) => {
                sqlx::query("UPDATE stream_records SET snapshot_outdated_at = now() WHERE aggregate_id = $1")
                    .bind(descriptor.aggregate_id)
                    .execute(&mut **transaction)
                    .await?;
            }
            Some(SnapshotOutdated::Clear) => {
                sqlx::query("UPDATE stream_records SET snapshot_outdated_at = NULL WHERE aggregate_id = $1")
                    .bind(descriptor.aggregate_id)
                    .execute(&mut **transaction)
                    .await?;
            }
            None => {}
        }

        Ok(())
    }

    async fn insert_command(
        &self,
        transaction: &mut Transaction<'_, Postgres>,
        command: &NewCommand,
    ) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO command_records \
             (user_id, aggregate_id, command_type, event_aggregate_id, event_sequence_number, command_json) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&command.user_id)
        .bind(command.aggregate_id)
        .bind(&command.command_type)
        .bind(command.event_aggregate_id)
        .bind(command.event_sequence_number)
        .bind(&command.command_json)
        .fetch_one(&mut **transaction)
        .await?;

        Ok(id)
    }

    async fn insert_event(
        &self,
        transaction: &mut Transaction<'_, Postgres>,
        aggregate_id: Uuid,
        event: &NewEvent,
        command_record_id: i64,
    ) -> Result<StoreEvent, StoreError> {
        let inserted: Result<(XactId,), sqlx::Error> = sqlx::query_as(
            "INSERT INTO event_records \
             (aggregate_id, sequence_number, created_at, event_type, event_json, command_record_id) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING xact_id",
        )
        .bind(aggregate_id)
        .bind(event.sequence_number)
        .bind(event.created_at)
        .bind(&event.event_type)
        .bind(&event.event_json)
        .bind(command_record_id)
        .fetch_one(&mut **transaction)
        .await;

        let (xact_id,) = match inserted {
            Ok(row) => row,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::OptimisticLocking {
                    aggregate_id,
                    cause: Box::new(sqlx::Error::Database(db_err)),
                });
            }
            Err(other) => return Err(other.into()),
        };

        Ok(StoreEvent {
            aggregate_id,
            sequence_number: event.sequence_number,
            created_at: event.created_at,
            event_type: event.event_type.clone(),
            event_json: event.event_json.clone(),
            command_record_id,
            xact_id,
        })
    }

    /// Loads `(stream, events)` pairs for a batch of aggregate ids in a
    /// single round trip: the stream row and its post-snapshot events are
    /// fetched together by one query per aggregate, so there is never a
    /// window between reading `events_partition_key` and reading the
    /// events in which a concurrent writer could flip the key and strand
    /// the read between partitions.
    async fn load_many(&self, aggregate_ids: &[Uuid]) -> Result<Vec<(StreamRecord, Vec<StoreEvent>)>, StoreError> {
        if aggregate_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT
                s.aggregate_id   AS stream_aggregate_id,
                s.created_at     AS stream_created_at,
                s.aggregate_type,
                s.snapshot_threshold,
                s.events_partition_key,
                s.snapshot_outdated_at,
                e.sequence_number,
                e.created_at     AS event_created_at,
                e.event_type,
                e.event_json,
                e.command_record_id,
                e.xact_id
            FROM stream_records s
            LEFT JOIN event_records e
                ON e.aggregate_id = s.aggregate_id
               AND e.sequence_number > COALESCE(
                     (SELECT MAX(sr.sequence_number) FROM snapshot_records sr WHERE sr.aggregate_id = s.aggregate_id),
                     0
                   )
            WHERE s.aggregate_id = ANY($1)
            ORDER BY s.aggregate_id, e.sequence_number
            "#,
        )
        .bind(aggregate_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut result: Vec<(StreamRecord, Vec<StoreEvent>)> = Vec::new();

        for row in &rows {
            let stream_aggregate_id: Uuid = row.try_get("stream_aggregate_id")?;

            if result.last().map(|(s, _)| s.aggregate_id) != Some(stream_aggregate_id) {
                result.push((
                    StreamRecord {
                        aggregate_id: stream_aggregate_id,
                        created_at: row.try_get("stream_created_at")?,
                        aggregate_type: row.try_get("aggregate_type")?,
                        snapshot_threshold: row.try_get("snapshot_threshold")?,
                        events_partition_key: row.try_get("events_partition_key")?,
                        snapshot_outdated_at: row.try_get("snapshot_outdated_at")?,
                    },
                    Vec::new(),
                ));
            }

            let sequence_number: Option<SequenceNumber> = row.try_get("sequence_number")?;
            let Some(sequence_number) = sequence_number else {
                continue;
            };

            result.last_mut().unwrap().1.push(StoreEvent {
                aggregate_id: stream_aggregate_id,
                sequence_number,
                created_at: row.try_get("event_created_at")?,
                event_type: row.try_get("event_type")?,
                event_json: row.try_get("event_json")?,
                command_record_id: row.try_get("command_record_id")?,
                xact_id: row.try_get("xact_id")?,
            });
        }

        Ok(result)
    }
}

#[async_trait]
impl crate::store::EventStore for PgEventStore {
    #[tracing::instrument(skip_all, err)]
    async fn commit_events(
        &self,
        command: NewCommand,
        streams: Vec<(StreamDescriptor, Vec<NewEvent>)>,
    ) -> Result<Vec<StoreEvent>, StoreError> {
        let mut transaction = self.pool.begin().await?;

        for (descriptor, _) in &streams {
            self.upsert_stream(&mut transaction, descriptor).await?;
        }

        let command_record_id = self.insert_command(&mut transaction, &command).await?;

        let mut committed = Vec::new();
        for (descriptor, events) in &streams {
            for event in events {
                let store_event = self
                    .insert_event(&mut transaction, descriptor.aggregate_id, event, command_record_id)
                    .await?;
                committed.push(store_event);
            }
        }

        transaction.commit().await?;

        let config = Configuration::current();
        if !config.disable_event_handlers {
            crate::publisher::publish_events(committed.clone(), &config.event_handlers).await?;
        }

        Ok(committed)
    }

    async fn load_events(&self, aggregate_id: Uuid) -> Result<Option<(StreamRecord, Vec<StoreEvent>)>, StoreError> {
        Ok(self.load_many(&[aggregate_id]).await?.into_iter().next())
    }

    async fn load_events_for_aggregates(
        &self,
        aggregate_ids: &[Uuid],
    ) -> Result<Vec<(StreamRecord, Vec<StoreEvent>)>, StoreError> {
        self.load_many(aggregate_ids).await
    }

    async fn load_event(
        &self,
        aggregate_id: Uuid,
        sequence_number: SequenceNumber,
    ) -> Result<Option<StoreEvent>, StoreError> {
        let row: Option<EventRow> = sqlx::query_as(
            "SELECT aggregate_id, sequence_number, created_at, event_type, event_json, command_record_id, xact_id \
             FROM event_records WHERE aggregate_id = $1 AND sequence_number = $2",
        )
        .bind(aggregate_id)
        .bind(sequence_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn load_command(&self, command_id: i64) -> Result<Option<crate::command::CommandRecord>, StoreError> {
        let row: Option<super::records::CommandRow> = sqlx::query_as(
            "SELECT id, user_id, aggregate_id, command_type, event_aggregate_id, event_sequence_number, \
             command_json, created_at FROM command_records WHERE id = $1",
        )
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn stream_events_for_aggregate<'s>(
        &'s self,
        aggregate_id: Uuid,
        load_until: Option<DateTime<Utc>>,
    ) -> Result<BoxStream<'s, Result<(StreamRecord, StoreEvent), StoreError>>, StoreError> {
        let stream_row: Option<(Uuid, DateTime<Utc>, String, Option<i32>, String, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                "SELECT aggregate_id, created_at, aggregate_type, snapshot_threshold, events_partition_key, \
                 snapshot_outdated_at FROM stream_records WHERE aggregate_id = $1",
            )
            .bind(aggregate_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some((aggregate_id, created_at, aggregate_type, snapshot_threshold, events_partition_key, snapshot_outdated_at)) =
            stream_row
        else {
            return Err(StoreError::NoEventsForAggregate(aggregate_id));
        };

        let stream = StreamRecord {
            aggregate_id,
            created_at,
            aggregate_type,
            snapshot_threshold,
            events_partition_key,
            snapshot_outdated_at,
        };

        let rows: Vec<EventRow> = if let Some(load_until) = load_until {
            sqlx::query_as(
                "SELECT aggregate_id, sequence_number, created_at, event_type, event_json, command_record_id, xact_id \
                 FROM event_records WHERE aggregate_id = $1 AND created_at < $2 ORDER BY sequence_number",
            )
            .bind(aggregate_id)
            .bind(load_until)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT aggregate_id, sequence_number, created_at, event_type, event_json, command_record_id, xact_id \
                 FROM event_records WHERE aggregate_id = $1 ORDER BY sequence_number",
            )
            .bind(aggregate_id)
            .fetch_all(&self.pool)
            .await?
        };

        if rows.is_empty() {
            return Err(StoreError::NoEventsForAggregate(aggregate_id));
        }

        let items: Vec<Result<(StreamRecord, StoreEvent), StoreError>> = rows
            .into_iter()
            .map(move |row| Ok((stream.clone(), row.into())))
            .collect();

        Ok(stream::iter(items).boxed())
    }

    async fn store_snapshots(&self, snapshots: Vec<NewSnapshot>) -> Result<(), StoreError> {
        let mut transaction = self.pool.begin().await?;

        for snapshot in &snapshots {
            sqlx::query(
                "INSERT INTO snapshot_records (aggregate_id, sequence_number, snapshot_type, snapshot_json) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(snapshot.aggregate_id)
            .bind(snapshot.sequence_number)
            .bind(&snapshot.snapshot_type)
            .bind(&snapshot.snapshot_json)
            .execute(&mut *transaction)
            .await?;

            sqlx::query("UPDATE stream_records SET snapshot_outdated_at = NULL WHERE aggregate_id = $1")
                .bind(snapshot.aggregate_id)
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn load_latest_snapshot(&self, aggregate_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        let row: Option<super::records::SnapshotRow> = sqlx::query_as(
            "SELECT aggregate_id, sequence_number, created_at, snapshot_type, snapshot_json FROM snapshot_records \
             WHERE aggregate_id = $1 ORDER BY sequence_number DESC LIMIT 1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn mark_aggregate_for_snapshotting(&self, aggregate_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE stream_records SET snapshot_outdated_at = now() WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_aggregate_for_snapshotting(&self, aggregate_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE stream_records SET snapshot_outdated_at = NULL WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_aggregates_for_snapshotting_with_last_event_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE stream_records SET snapshot_outdated_at = NULL WHERE aggregate_id IN ( \
               SELECT aggregate_id FROM event_records GROUP BY aggregate_id HAVING MAX(created_at) < $1 \
             )",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn aggregates_that_need_snapshots(
        &self,
        last_id: Option<Uuid>,
        limit: Option<i64>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT aggregate_id FROM stream_records \
             WHERE snapshot_outdated_at IS NOT NULL AND ($1::uuid IS NULL OR aggregate_id > $1) \
             ORDER BY aggregate_id LIMIT $2",
        )
        .bind(last_id)
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn aggregates_that_need_snapshots_ordered_by_priority(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT aggregate_id FROM stream_records WHERE snapshot_outdated_at IS NOT NULL \
             ORDER BY snapshot_outdated_at ASC LIMIT $1",
        )
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_snapshots_before(
        &self,
        aggregate_id: Uuid,
        sequence_number: SequenceNumber,
    ) -> Result<(), StoreError> {
        let mut transaction = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM snapshot_records WHERE aggregate_id = $1 AND sequence_number < $2")
            .bind(aggregate_id)
            .bind(sequence_number)
            .execute(&mut *transaction)
            .await?;

        if deleted.rows_affected() > 0 {
            self.remark_if_orphaned(&mut transaction, aggregate_id).await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn delete_all_snapshots(&self) -> Result<(), StoreError> {
        let mut transaction = self.pool.begin().await?;

        sqlx::query("DELETE FROM snapshot_records").execute(&mut *transaction).await?;

        sqlx::query(
            "UPDATE stream_records SET snapshot_outdated_at = now() \
             WHERE aggregate_id IN (SELECT DISTINCT aggregate_id FROM event_records)",
        )
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        Ok(())
    }

    async fn permanently_delete_event_stream(&self, aggregate_id: Uuid) -> Result<(), StoreError> {
        let mut transaction = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO saved_event_records \
             (aggregate_id, sequence_number, created_at, event_type, event_json, command_record_id, xact_id, operation) \
             SELECT aggregate_id, sequence_number, created_at, event_type, event_json, command_record_id, xact_id, 'D' \
             FROM event_records WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .execute(&mut *transaction)
        .await?;

        sqlx::query("DELETE FROM snapshot_records WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&mut *transaction)
            .await?;

        sqlx::query("DELETE FROM event_records WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&mut *transaction)
            .await?;

        sqlx::query("DELETE FROM stream_records WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;
        Ok(())
    }

    async fn permanently_delete_commands_without_events(&self, aggregate_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM command_records \
             WHERE (aggregate_id = $1 OR event_aggregate_id = $1) \
               AND id NOT IN (SELECT command_record_id FROM event_records)",
        )
        .bind(aggregate_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_exists(&self, aggregate_id: Uuid) -> Result<bool, StoreError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM event_records WHERE aggregate_id = $1)")
                .bind(aggregate_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn stream_exists(&self, aggregate_id: Uuid) -> Result<bool, StoreError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM stream_records WHERE aggregate_id = $1)")
                .bind(aggregate_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn replay_events_from_cursor<F>(
        &self,
        block_size: u32,
        handlers: &[std::sync::Arc<dyn MessageHandler>],
        on_progress: F,
    ) -> Result<(), StoreError>
    where
        F: Fn(u64, XactId, Uuid) + Send + Sync,
    {
        let mut rows = sqlx::query_as::<_, EventRow>(
            "SELECT aggregate_id, sequence_number, created_at, event_type, event_json, command_record_id, xact_id \
             FROM event_records ORDER BY xact_id, aggregate_id, sequence_number",
        )
        .fetch(&self.pool);

        let mut cumulative: u64 = 0;
        let mut in_block: u32 = 0;
        let mut last_xact_id: XactId = 0;
        let mut last_aggregate_id: Uuid = Uuid::nil();

        while let Some(row) = rows.next().await {
            let row = row?;
            let event: StoreEvent = row.into();

            for handler in handlers {
                if handler.handles_message(&event.event_type) {
                    handler
                        .handle(&event)
                        .await
                        .map_err(|cause| crate::error::PublishEventError {
                            handler_name: handler.name(),
                            event_type: event.event_type.clone(),
                            aggregate_id: event.aggregate_id,
                            sequence_number: event.sequence_number,
                            cause,
                        })?;
                }
            }

            cumulative += 1;
            in_block += 1;
            last_xact_id = event.xact_id;
            last_aggregate_id = event.aggregate_id;

            if in_block == block_size {
                on_progress(cumulative, last_xact_id, last_aggregate_id);
                in_block = 0;
            }
        }

        if in_block > 0 {
            on_progress(cumulative, last_xact_id, last_aggregate_id);
        }

        Ok(())
    }
}

impl PgEventStore {
    async fn remark_if_orphaned(
        &self,
        transaction: &mut Transaction<'_, Postgres>,
        aggregate_id: Uuid,
    ) -> Result<(), StoreError> {
        let (has_snapshot,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM snapshot_records WHERE aggregate_id = $1)")
                .bind(aggregate_id)
                .fetch_one(&mut **transaction)
                .await?;

        if has_snapshot {
            return Ok(());
        }

        let (has_events,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM event_records WHERE aggregate_id = $1)")
                .bind(aggregate_id)
                .fetch_one(&mut **transaction)
                .await?;

        if has_events {
            sqlx::query("UPDATE stream_records SET snapshot_outdated_at = now() WHERE aggregate_id = $1")
                .bind(aggregate_id)
                .execute(&mut **transaction)
                .await?;
        }

        Ok(())
    }
}
