use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::{SequenceNumber, XactId};

/// An event about to be committed, before it has been assigned a
/// `command_record_id` or `xact_id` by the store.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub aggregate_id: Uuid,
    pub sequence_number: SequenceNumber,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub event_json: Value,
}

impl NewEvent {
    pub fn new(
        aggregate_id: Uuid,
        sequence_number: SequenceNumber,
        event_type: impl Into<String>,
        event_json: Value,
    ) -> Self {
        Self {
            aggregate_id,
            sequence_number,
            created_at: Utc::now(),
            event_type: event_type.into(),
            event_json,
        }
    }
}

/// A persisted, immutable event row.
///
/// The payload is kept as a [`serde_json::Value`] here because the store
/// itself is not generic over any one aggregate's event type: callers
/// reconstruct their own strongly typed event with [`StoreEvent::deserialize`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub aggregate_id: Uuid,
    pub sequence_number: SequenceNumber,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub event_json: Value,
    pub command_record_id: i64,
    pub xact_id: XactId,
}

impl StoreEvent {
    /// Deserializes the stored JSON payload into a caller-chosen event type.
    pub fn deserialize<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.event_json.clone())
    }
}
