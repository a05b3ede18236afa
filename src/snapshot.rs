use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::SequenceNumber;

/// A materialized aggregate state about to be stored.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub aggregate_id: Uuid,
    pub sequence_number: SequenceNumber,
    pub snapshot_type: String,
    pub snapshot_json: Value,
}

impl NewSnapshot {
    pub fn new(
        aggregate_id: Uuid,
        sequence_number: SequenceNumber,
        snapshot_type: impl Into<String>,
        snapshot_json: Value,
    ) -> Self {
        Self {
            aggregate_id,
            sequence_number,
            snapshot_type: snapshot_type.into(),
            snapshot_json,
        }
    }
}

/// A persisted materialized aggregate state at a specific sequence number.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub aggregate_id: Uuid,
    pub sequence_number: SequenceNumber,
    pub created_at: DateTime<Utc>,
    pub snapshot_type: String,
    pub snapshot_json: Value,
}
