//! Postgres-backed [`crate::store::EventStore`] implementation.

mod event_store;
mod records;
mod schema;

pub use event_store::PgEventStore;
pub use schema::Migrator;

use sqlx::{Pool, Postgres};
use typed_builder::TypedBuilder;

/// Builds a [`PgEventStore`], running the schema migrations once up front
/// unless told not to.
///
/// Mirrors the teacher crate's bus builders: a `TypedBuilder`-derived field
/// set plus a hand-written async finisher, since running migrations can't be
/// expressed in the generated, synchronous `build()`.
#[derive(TypedBuilder)]
pub struct PgEventStoreBuilder {
    pool: Pool<Postgres>,
    #[builder(default = true)]
    run_migrations: bool,
}

impl PgEventStoreBuilder {
    /// Runs migrations (unless disabled with `.run_migrations(false)`) and
    /// returns a ready-to-use [`PgEventStore`].
    pub async fn try_build(self) -> Result<PgEventStore, sqlx::Error> {
        if self.run_migrations {
            Migrator::run(&self.pool).await?;
        }

        Ok(PgEventStore::new(self.pool))
    }
}

#[cfg(test)]
mod tests {
    use sqlx::{Pool, Postgres};

    use super::*;

    #[sqlx::test]
    async fn try_build_runs_migrations_by_default(pool: Pool<Postgres>) {
        let store = PgEventStoreBuilder::builder().pool(pool).build().try_build().await;
        assert!(store.is_ok());
    }
}
