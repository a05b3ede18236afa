use uuid::Uuid;

use crate::SequenceNumber;

/// The in-memory state of one aggregate instance, tagged with the sequence
/// number of the last event folded into it.
#[derive(Debug, Clone)]
pub struct AggregateState<S> {
    id: Uuid,
    sequence_number: SequenceNumber,
    inner: S,
}

impl<S: Default> AggregateState<S> {
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            sequence_number: 0,
            inner: Default::default(),
        }
    }
}

impl<S> AggregateState<S> {
    pub fn with_state(id: Uuid, sequence_number: SequenceNumber, inner: S) -> Self {
        Self {
            id,
            sequence_number,
            inner,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// The sequence number the next committed event for this aggregate
    /// should carry.
    pub fn next_sequence_number(&self) -> SequenceNumber {
        self.sequence_number + 1
    }

    /// Folds one event onto the state using `apply`, advancing the
    /// sequence number to `sequence_number`.
    pub fn apply<E>(mut self, event: E, sequence_number: SequenceNumber, apply: impl FnOnce(S, E) -> S) -> Self {
        self.inner = apply(self.inner, event);
        self.sequence_number = sequence_number;
        self
    }
}
