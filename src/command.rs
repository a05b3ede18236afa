use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::SequenceNumber;

/// The command about to be recorded alongside the events it produced.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub user_id: Option<String>,
    pub aggregate_id: Option<Uuid>,
    pub command_type: String,
    /// Back-reference set when this command was issued by a workflow
    /// reacting to an event, rather than by an external caller.
    pub event_aggregate_id: Option<Uuid>,
    pub event_sequence_number: Option<SequenceNumber>,
    pub command_json: Value,
}

impl NewCommand {
    pub fn new(command_type: impl Into<String>, command_json: Value) -> Self {
        Self {
            user_id: None,
            aggregate_id: None,
            command_type: command_type.into(),
            event_aggregate_id: None,
            event_sequence_number: None,
            command_json,
        }
    }

    pub fn for_aggregate(mut self, aggregate_id: Uuid) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn by_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn reacting_to(mut self, aggregate_id: Uuid, sequence_number: SequenceNumber) -> Self {
        self.event_aggregate_id = Some(aggregate_id);
        self.event_sequence_number = Some(sequence_number);
        self
    }
}

/// The persisted record of a command and the events it produced.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub id: i64,
    pub user_id: Option<String>,
    pub aggregate_id: Option<Uuid>,
    pub command_type: String,
    pub event_aggregate_id: Option<Uuid>,
    pub event_sequence_number: Option<SequenceNumber>,
    pub command_json: Value,
    pub created_at: DateTime<Utc>,
}
