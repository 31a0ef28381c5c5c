use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::debug;

use crate::migrations;

pub type DbPool = sqlx::SqlitePool;

pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .connect_with(options)
        .await?;

    debug!(
        event_name = "db.pool.connected",
        max_connections = max_connections.max(1),
        "sqlite pool connected"
    );
    Ok(pool)
}

/// Connects and applies every pending migration, the startup path used by the CLI.
pub async fn connect_and_migrate(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, ConnectError> {
    let pool = connect_with_settings(database_url, max_connections, timeout_secs)
        .await
        .map_err(ConnectError::Connect)?;
    migrations::run_pending(&pool).await.map_err(ConnectError::Migrate)?;
    Ok(pool)
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migrate(#[source] sqlx::migrate::MigrateError),
}
