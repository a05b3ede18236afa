use serde::de::DeserializeOwned;
use serde::Serialize;

/// An event payload that knows its own wire tag.
///
/// `event_type` is stored in the `event_type` column of `event_records`
/// alongside the serialized JSON, so that handlers and replay consumers can
/// decide whether to act on a row before (or without) deserializing it.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;
}

/// The aggregate is responsible for validating commands and folding events
/// onto its own state. It is purposefully synchronous: loading, persisting,
/// and dispatching are the event store's job, not the aggregate's.
///
/// Applying the same events, in the same order, onto the same initial state
/// must always yield an identical result.
pub trait Aggregate {
    /// Unique name for this aggregate type. Used as `aggregate_type` on the
    /// stream record; changing it severs the link to existing streams.
    const NAME: &'static str;

    type State: Default + Clone + Send + Sync;
    type Command: Send;
    type Event: DomainEvent;
    type Error: std::error::Error + Send + Sync;

    /// Validates a command against the current state and produces the
    /// events that should be committed, or a domain error.
    fn handle_command(state: &Self::State, command: Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Folds one event onto the state. May panic if the event cannot
    /// possibly apply to this state; the store never invokes this with
    /// events out of sequence-number order.
    fn apply_event(state: Self::State, event: Self::Event) -> Self::State;
}
