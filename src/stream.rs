use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The identity row of an aggregate: exactly one per `aggregate_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub created_at: DateTime<Utc>,
    pub snapshot_threshold: Option<i32>,
    pub events_partition_key: String,
    pub snapshot_outdated_at: Option<DateTime<Utc>>,
}

/// How `commit_events` should create-or-update the [`StreamRecord`] for one
/// of the streams being written to.
///
/// `events_partition_key` and `snapshot_outdated` are `None` when the caller
/// doesn't want to touch the existing value; `aggregate_type` and
/// `snapshot_threshold` only take effect the first time a stream is created,
/// since `aggregate_type` is immutable thereafter.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub snapshot_threshold: Option<i32>,
    pub events_partition_key: Option<String>,
    pub snapshot_outdated: Option<SnapshotOutdated>,
}

impl StreamDescriptor {
    pub fn new(aggregate_id: Uuid, aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            snapshot_threshold: None,
            events_partition_key: None,
            snapshot_outdated: None,
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.events_partition_key = Some(key.into());
        self
    }

    pub fn mark_snapshot_outdated(mut self) -> Self {
        self.snapshot_outdated = Some(SnapshotOutdated::Mark);
        self
    }

    pub fn clear_snapshot_outdated(mut self) -> Self {
        self.snapshot_outdated = Some(SnapshotOutdated::Clear);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutdated {
    Mark,
    Clear,
}

pub(crate) const DEFAULT_PARTITION_KEY: &str = "default";
