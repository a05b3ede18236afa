use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

use crate::handler::MessageHandler;

/// Snapshot of the process-wide configuration.
///
/// Held behind a lock-free [`ArcSwap`] so reading it on the hot
/// commit/publish path never blocks a concurrent reconfiguration; a
/// reconfigure builds a whole new `Arc<ConfigurationInner>` and swaps the
/// pointer rather than mutating fields in place.
#[derive(Clone)]
pub struct ConfigurationInner {
    /// Handlers registered for publication, in registration order.
    /// Re-assigning this list replaces it wholesale; it is never appended to
    /// implicitly.
    pub event_handlers: Vec<Arc<dyn MessageHandler>>,
    /// When `true`, `commit_events` never touches the publisher queue.
    pub disable_event_handlers: bool,
    /// Whether the store caches the `event_type -> deserializer` mapping.
    /// Retained for interface parity with the source system; Rust has no
    /// notion of a redefinable event class, so a fresh
    /// `serde_json::from_value::<A::Event>` call is always correct and this
    /// flag does not change behavior. See DESIGN.md.
    pub event_store_cache_event_types: bool,
}

impl Default for ConfigurationInner {
    fn default() -> Self {
        Self {
            event_handlers: Vec::new(),
            disable_event_handlers: false,
            event_store_cache_event_types: true,
        }
    }
}

static CONFIGURATION: Lazy<ArcSwap<ConfigurationInner>> =
    Lazy::new(|| ArcSwap::from_pointee(ConfigurationInner::default()));

/// Process-wide configuration registry (component F).
///
/// There is no per-instance state here: `Configuration` is a handle onto a
/// single swappable [`ConfigurationInner`] shared by the whole process,
/// matching the spec's "process-wide injectable registry".
pub struct Configuration;

impl Configuration {
    /// Returns the currently active configuration.
    pub fn current() -> Arc<ConfigurationInner> {
        CONFIGURATION.load_full()
    }

    /// Replaces the event handler list wholesale.
    pub fn set_event_handlers(handlers: Vec<Arc<dyn MessageHandler>>) {
        Self::update(|inner| inner.event_handlers = handlers);
    }

    /// Sets whether `commit_events` publishes to handlers at all.
    pub fn set_disable_event_handlers(disabled: bool) {
        Self::update(|inner| inner.disable_event_handlers = disabled);
    }

    /// Sets whether the store caches resolved event-type deserializers.
    pub fn set_event_store_cache_event_types(cache: bool) {
        Self::update(|inner| inner.event_store_cache_event_types = cache);
    }

    fn update(f: impl FnOnce(&mut ConfigurationInner)) {
        let mut next = (*Self::current()).clone();
        f(&mut next);
        CONFIGURATION.store(Arc::new(next));
    }

    /// Restores the default configuration, discarding any registered
    /// handlers and toggles. Intended for test teardown.
    pub fn reset() {
        CONFIGURATION.store(Arc::new(ConfigurationInner::default()));
    }

    /// Checkpoints the current configuration so it can be restored later,
    /// letting tests mutate freely and roll back on teardown.
    pub fn snapshot() -> ConfigurationGuard {
        ConfigurationGuard(Self::current())
    }
}

/// A checkpoint of the configuration taken by [`Configuration::snapshot`].
pub struct ConfigurationGuard(Arc<ConfigurationInner>);

impl ConfigurationGuard {
    /// Restores the configuration to the state it was in when this guard
    /// was created.
    pub fn restore(self) {
        CONFIGURATION.store(self.0);
    }
}

/// A lock serializing every test in the crate that mutates the process-wide
/// [`Configuration`]. `Configuration` itself has no notion of test isolation
/// (it is a single swappable pointer shared by the whole process), so tests
/// here and in `store::postgres::event_store` that reconfigure it share this
/// lock rather than each declaring their own.
#[cfg(test)]
pub(crate) mod test_lock {
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    pub(crate) static CONFIG_TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::test_lock::CONFIG_TEST_LOCK as SERIAL;
    use super::*;
    use crate::event::StoreEvent;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        fn handled_types(&self) -> &'static [&'static str] {
            &["anything"]
        }

        async fn handle(&self, _event: &StoreEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    #[test]
    fn reconfigure_replaces_rather_than_appends() {
        let _serial = SERIAL.lock().unwrap();
        let guard = Configuration::snapshot();

        Configuration::set_event_handlers(vec![Arc::new(NoopHandler)]);
        assert_eq!(Configuration::current().event_handlers.len(), 1);

        Configuration::set_event_handlers(vec![Arc::new(NoopHandler), Arc::new(NoopHandler)]);
        assert_eq!(Configuration::current().event_handlers.len(), 2);

        guard.restore();
        assert!(Configuration::current().event_handlers.is_empty());
    }

    #[test]
    fn reset_restores_defaults() {
        let _serial = SERIAL.lock().unwrap();
        let guard = Configuration::snapshot();

        Configuration::set_disable_event_handlers(true);
        assert!(Configuration::current().disable_event_handlers);

        Configuration::reset();
        assert!(!Configuration::current().disable_event_handlers);

        guard.restore();
    }
}
