use std::collections::HashMap;
use std::future::Future;

use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::state::AggregateState;

/// A per-unit-of-work cache of loaded aggregate instances.
///
/// Exists so that multiple loads of the same aggregate within one command
/// execution return the *same* in-memory object: identity, not just
/// equality. The owning command manager clears it at the end of every
/// transaction with [`clear`](Self::clear).
pub struct AggregateRepository<A: Aggregate> {
    cache: HashMap<Uuid, AggregateState<A::State>>,
}

impl<A: Aggregate> Default for AggregateRepository<A> {
    fn default() -> Self {
        Self { cache: HashMap::new() }
    }
}

impl<A: Aggregate> AggregateRepository<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empties the cache. Called between transactions.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn get(&self, aggregate_id: Uuid) -> Option<&AggregateState<A::State>> {
        self.cache.get(&aggregate_id)
    }

    pub fn put(&mut self, state: AggregateState<A::State>) {
        self.cache.insert(state.id(), state);
    }

    /// Returns the cached state for `aggregate_id`, loading it with `loader`
    /// on a cache miss. `loader` is only invoked once per aggregate per unit
    /// of work, regardless of how many times `get_or_load` is called for it.
    pub async fn get_or_load<F, Fut, E>(
        &mut self,
        aggregate_id: Uuid,
        loader: F,
    ) -> Result<&AggregateState<A::State>, E>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = Result<AggregateState<A::State>, E>>,
    {
        if let std::collections::hash_map::Entry::Vacant(entry) = self.cache.entry(aggregate_id) {
            let loaded = loader(aggregate_id).await?;
            entry.insert(loaded);
        }

        Ok(self.cache.get(&aggregate_id).expect("just populated above"))
    }
}
