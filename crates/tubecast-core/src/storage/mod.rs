//! SQLite storage layer for TubeCast.
//!
//! Provides database initialization, connection pooling, and CRUD
//! operations for all persistent entities. The same database file backs
//! both the entity tables and the durable job queue, so the pool is
//! shared by every worker in the process.

pub mod accounts;
pub mod api_profiles;
pub mod comments;
pub mod proxies;
pub mod schedules;
pub mod users;
pub mod view_schedules;

use crate::error::StorageError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::PathBuf;
use std::time::Duration;

/// Type alias for the SQLite connection pool.
pub type DbPool = sqlx::SqlitePool;

/// Timestamp format used for all TEXT datetime columns.
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Current UTC time formatted for a TEXT datetime column.
pub fn now_ts() -> String {
    chrono::Utc::now().format(TS_FORMAT).to_string()
}

/// Format an arbitrary UTC time for a TEXT datetime column.
pub fn format_ts(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format(TS_FORMAT).to_string()
}

/// Parse a TEXT datetime column. Accepts RFC 3339 with or without fraction.
pub fn parse_ts(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}

/// Size the connection pool for a given worker-pool total.
///
/// SQLite allows only one writer at a time, so connections well short of
/// the worker count win: the default 110 workers (5 schedule + 100 post
/// + 5 view) get 13 connections, enough to keep readers unblocked while
/// writers queue on the WAL lock instead of on connection acquisition.
pub fn pool_size_for_workers(total_workers: u32) -> u32 {
    (total_workers / 8).clamp(2, 16)
}

/// Open (creating if needed) the TubeCast database and run migrations.
///
/// `~` in the path resolves to the home directory, and missing parent
/// directories are created. WAL journaling keeps the 100-strong posting
/// pool's reads from stalling behind writers; the busy timeout covers
/// writer contention bursts at full dispatch rate.
pub async fn init_db(db_path: &str, pool_size: u32) -> Result<DbPool, StorageError> {
    let file = resolve_db_path(db_path);

    if let Some(dir) = file.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(|e| StorageError::Connection {
                source: sqlx::Error::Configuration(
                    format!("cannot create {}: {e}", dir.display()).into(),
                ),
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(&file)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(10))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size.max(1))
        .connect_with(options)
        .await
        .map_err(connection_error)?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Initialize an in-memory SQLite database for testing.
///
/// A single connection keeps the in-memory database alive for the
/// test's whole lifetime.
#[cfg(any(test, feature = "test-helpers"))]
pub async fn init_test_db() -> Result<DbPool, StorageError> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(connection_error)?;

    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|source| StorageError::Migration { source })
}

fn connection_error(source: sqlx::Error) -> StorageError {
    StorageError::Connection { source }
}

/// Resolve the configured database path, expanding a leading `~`.
fn resolve_db_path(raw: &str) -> PathBuf {
    let home = dirs::home_dir();
    match (raw.strip_prefix("~/"), raw == "~", home) {
        (Some(tail), _, Some(home)) => home.join(tail),
        (None, true, Some(home)) => home,
        _ => PathBuf::from(raw),
    }
}
