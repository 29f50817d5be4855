//! Persistence layer: SQLite with sqlx.
//!
//! Holds the durable job queue and the fingerprint store. WAL mode keeps
//! reads concurrent with the workers' claim/ack writes.

pub mod retry;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Persistent job and fingerprint schema.
///
/// `job.queued_at` orders the FIFO and moves on requeue; `job.enqueued_at`
/// is the immutable admission timestamp.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS job (
    id               TEXT PRIMARY KEY,
    fingerprint      TEXT NOT NULL,
    source_url       TEXT NOT NULL,
    requester_id     INTEGER NOT NULL,
    status           TEXT NOT NULL DEFAULT 'PENDING',
    attempt_count    INTEGER NOT NULL DEFAULT 0,
    enqueued_at      TEXT NOT NULL,
    queued_at        TEXT NOT NULL,
    claimed_by       TEXT,
    claim_expires_at TEXT,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_status_queued ON job (status, queued_at);
CREATE INDEX IF NOT EXISTS idx_job_fingerprint ON job (fingerprint);

CREATE TABLE IF NOT EXISTS dead_letter (
    id            TEXT PRIMARY KEY,
    fingerprint   TEXT NOT NULL,
    source_url    TEXT NOT NULL,
    requester_id  INTEGER NOT NULL,
    attempt_count INTEGER NOT NULL,
    reason        TEXT NOT NULL,
    enqueued_at   TEXT NOT NULL,
    failed_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fingerprint_entry (
    fingerprint TEXT PRIMARY KEY,
    result_ref  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
"#;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA cache_size = -64000")
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Initialize the connection pool with WAL mode and performance pragmas.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DEFAULT_POOL_SIZE)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options)
        .await?;

    tracing::info!(
        "Database pool initialized with WAL mode, {} max connections",
        DEFAULT_POOL_SIZE
    );

    Ok(pool)
}

/// Create the schema if it does not exist yet.
pub async fn run_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    tracing::info!("Ensuring database schema...");
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

/// In-memory pool with the schema applied. Used by tests.
pub async fn memory_pool() -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
        .await?;
    run_schema(&pool).await?;
    Ok(pool)
}
