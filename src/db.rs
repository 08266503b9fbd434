//! SQLite pool construction and schema helpers shared by the metadata
//! repository and the queue client.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, time::Duration};
use tracing::debug;

/// Schema of the metadata database.
pub const METADATA_SCHEMA: &str = include_str!("../migrations/0001_init.sql");

/// Open a pool on `url`, creating the database file when missing.
///
/// `connect_timeout` bounds both pool acquisition and SQLite's busy wait.
pub async fn connect(
    url: &str,
    connect_timeout: Duration,
    max_connections: u32,
) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(connect_timeout);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(connect_timeout)
        .connect_with(options)
        .await
}

/// Execute every `;`-separated statement of `sql` in order.
pub async fn apply_schema(db: &SqlitePool, sql: &str) -> Result<usize, sqlx::Error> {
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    for stmt in &statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(statements.len())
}

/// Return true if SQLx error indicates a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Errors worth another attempt: pool exhaustion, I/O and lock contention.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    connect("sqlite::memory:", Duration::from_secs(5), 1)
        .await
        .expect("in-memory sqlite")
}
