use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::types::Result;

/// Open the SQLite pool and bring the schema up to date.
///
/// In-memory databases get a single connection so every caller sees the same
/// database; file-backed databases use WAL and a small pool.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let in_memory = database_url.contains(":memory:");

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(if in_memory {
            SqliteJournalMode::Memory
        } else {
            SqliteJournalMode::Wal
        });

    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database ready at {}", database_url);
    Ok(pool)
}

/// Shared helper for tests and ephemeral runs.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    connect("sqlite::memory:").await
}
