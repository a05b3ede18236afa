use async_trait::async_trait;

use crate::event::StoreEvent;

/// A projector or workflow reacting to events committed by the store.
///
/// The spec models dispatch as a per-event-class callback map; since a
/// [`StoreEvent`] carries its `event_type` as a plain string rather than a
/// concrete class, that table is realized here as [`handled_types`] plus a
/// `match`/lookup inside [`handle`] itself — the idiomatic rendition of a
/// dynamic registry when there is no open class hierarchy to register
/// against.
///
/// Unlike the teacher crate's non-transactional `EventHandler`, `handle`
/// returns a `Result`: the spec requires any handler failure during
/// publication to abort the drain and propagate as a
/// [`crate::error::PublishEventError`], so every handler is treated the way
/// the teacher treats only its `TransactionalEventHandler`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The event types this handler is registered for. Events whose
    /// `event_type` is not in this list are silently skipped by the
    /// publisher without calling [`handle`].
    fn handled_types(&self) -> &'static [&'static str];

    /// Handles one matching event.
    async fn handle(&self, event: &StoreEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Whether this handler has a registered callback for `event_type`.
    fn handles_message(&self, event_type: &str) -> bool {
        self.handled_types().contains(&event_type)
    }

    /// Name used in tracing spans and in [`crate::error::PublishEventError`].
    /// Override to give a stabler name than the compiler-generated one.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
