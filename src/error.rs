use uuid::Uuid;

use crate::SequenceNumber;

/// Errors surfaced by the event store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A duplicate `(aggregate_id, sequence_number)` was detected on
    /// insert. Recoverable: the caller should reload the stream and retry
    /// the command that produced the conflicting event.
    #[error("optimistic locking failure committing event(s) for aggregate {aggregate_id}")]
    OptimisticLocking {
        aggregate_id: Uuid,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `stream_events_for_aggregate` was called but no events matched the
    /// requested window.
    #[error("no events for aggregate {0}")]
    NoEventsForAggregate(Uuid),

    /// A registered handler failed during publication; the underlying
    /// transaction should be rolled back by the caller.
    #[error(transparent)]
    Publish(#[from] PublishEventError),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Raised when a registered [`crate::MessageHandler`] fails while handling
/// an event during publication. Carries enough context to identify both the
/// handler and the offending event.
#[derive(Debug, thiserror::Error)]
#[error("handler {handler_name} failed handling {event_type} for aggregate {aggregate_id} (sequence {sequence_number})")]
pub struct PublishEventError {
    pub handler_name: &'static str,
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub sequence_number: SequenceNumber,
    #[source]
    pub cause: Box<dyn std::error::Error + Send + Sync>,
}
