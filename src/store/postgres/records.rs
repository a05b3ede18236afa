use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::command::CommandRecord;
use crate::event::StoreEvent;
use crate::snapshot::SnapshotRecord;
use crate::stream::StreamRecord;
use crate::{SequenceNumber, XactId};

/// Wire shape of one `stream_records` row.
#[derive(sqlx::FromRow, Debug)]
pub struct StreamRow {
    pub aggregate_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub aggregate_type: String,
    pub snapshot_threshold: Option<i32>,
    pub events_partition_key: String,
    pub snapshot_outdated_at: Option<DateTime<Utc>>,
}

impl From<StreamRow> for StreamRecord {
    fn from(row: StreamRow) -> Self {
        Self {
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            created_at: row.created_at,
            snapshot_threshold: row.snapshot_threshold,
            events_partition_key: row.events_partition_key,
            snapshot_outdated_at: row.snapshot_outdated_at,
        }
    }
}

/// Wire shape of one `event_records` row.
#[derive(sqlx::FromRow, Debug)]
pub struct EventRow {
    pub aggregate_id: Uuid,
    pub sequence_number: SequenceNumber,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub event_json: Value,
    pub command_record_id: i64,
    pub xact_id: XactId,
}

impl From<EventRow> for StoreEvent {
    fn from(row: EventRow) -> Self {
        Self {
            aggregate_id: row.aggregate_id,
            sequence_number: row.sequence_number,
            created_at: row.created_at,
            event_type: row.event_type,
            event_json: row.event_json,
            command_record_id: row.command_record_id,
            xact_id: row.xact_id,
        }
    }
}

/// Wire shape of one `snapshot_records` row.
#[derive(sqlx::FromRow, Debug)]
pub struct SnapshotRow {
    pub aggregate_id: Uuid,
    pub sequence_number: SequenceNumber,
    pub created_at: DateTime<Utc>,
    pub snapshot_type: String,
    pub snapshot_json: Value,
}

impl From<SnapshotRow> for SnapshotRecord {
    fn from(row: SnapshotRow) -> Self {
        Self {
            aggregate_id: row.aggregate_id,
            sequence_number: row.sequence_number,
            created_at: row.created_at,
            snapshot_type: row.snapshot_type,
            snapshot_json: row.snapshot_json,
        }
    }
}

/// Wire shape of one `command_records` row.
#[derive(sqlx::FromRow, Debug)]
pub struct CommandRow {
    pub id: i64,
    pub user_id: Option<String>,
    pub aggregate_id: Option<Uuid>,
    pub command_type: String,
    pub event_aggregate_id: Option<Uuid>,
    pub event_sequence_number: Option<SequenceNumber>,
    pub command_json: Value,
    pub created_at: DateTime<Utc>,
}

impl From<CommandRow> for CommandRecord {
    fn from(row: CommandRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            aggregate_id: row.aggregate_id,
            command_type: row.command_type,
            event_aggregate_id: row.event_aggregate_id,
            event_sequence_number: row.event_sequence_number,
            command_json: row.command_json,
            created_at: row.created_at,
        }
    }
}
