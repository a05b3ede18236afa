use sqlx::postgres::PgQueryResult;
use sqlx::{Pool, Postgres, Transaction};

/// Bit-exact schema from the spec, applied as a fixed, idempotent list of
/// `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS` statements —
/// the Rust-native replacement for the source system's migration DSL (only
/// the resulting schema matters here).
pub struct Migrator;

impl Migrator {
    /// Runs every migration inside one transaction. Safe to call on every
    /// process startup; each statement is a no-op if already applied.
    pub async fn run(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
        let mut transaction: Transaction<Postgres> = pool.begin().await?;

        for statement in STATEMENTS {
            let _: PgQueryResult = sqlx::query(statement).execute(&mut *transaction).await?;
        }

        transaction.commit().await
    }
}

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stream_records
    (
        aggregate_id uuid PRIMARY KEY NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        aggregate_type text NOT NULL,
        snapshot_threshold integer,
        events_partition_key text NOT NULL DEFAULT 'default',
        snapshot_outdated_at timestamptz
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS command_records
    (
        id bigserial PRIMARY KEY,
        user_id text,
        aggregate_id uuid,
        command_type text NOT NULL,
        event_aggregate_id uuid,
        event_sequence_number integer,
        command_json jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS command_records_event_aggregate_id_event_sequence_number_idx
        ON command_records (event_aggregate_id, event_sequence_number)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_records
    (
        aggregate_id uuid NOT NULL REFERENCES stream_records (aggregate_id),
        sequence_number integer NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        event_type text NOT NULL,
        event_json jsonb NOT NULL,
        command_record_id bigint NOT NULL REFERENCES command_records (id),
        xact_id bigint NOT NULL DEFAULT pg_current_xact_id()::text::bigint,
        PRIMARY KEY (aggregate_id, sequence_number)
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS event_records_command_record_id_idx ON event_records (command_record_id)"#,
    r#"CREATE INDEX IF NOT EXISTS event_records_event_type_idx ON event_records (event_type)"#,
    r#"CREATE INDEX IF NOT EXISTS event_records_created_at_idx ON event_records (created_at)"#,
    r#"CREATE INDEX IF NOT EXISTS event_records_xact_id_idx ON event_records (xact_id)"#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshot_records
    (
        aggregate_id uuid NOT NULL REFERENCES stream_records (aggregate_id),
        sequence_number integer NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        snapshot_type text NOT NULL,
        snapshot_json jsonb NOT NULL,
        PRIMARY KEY (aggregate_id, sequence_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS saved_event_records
    (
        aggregate_id uuid NOT NULL,
        sequence_number integer NOT NULL,
        created_at timestamptz NOT NULL,
        event_type text NOT NULL,
        event_json jsonb NOT NULL,
        command_record_id bigint NOT NULL,
        xact_id bigint NOT NULL,
        operation char(1) NOT NULL CHECK (operation IN ('U', 'D')),
        saved_at timestamptz NOT NULL DEFAULT now()
    )
    "#,
];
