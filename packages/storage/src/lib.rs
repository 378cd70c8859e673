// ABOUTME: Data layer and persistence for Sandkeep
// ABOUTME: SQLite pool setup, schema migrations and workspace/member records

pub mod workspaces;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info};

pub use sqlx::SqlitePool;
pub use workspaces::{Workspace, WorkspaceMember, WorkspaceRole, WorkspaceStorage};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Open a pool against `database_url`, creating the database file if needed
pub async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    debug!("Opening database: {}", database_url);

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Single-connection in-memory database with migrations applied.
///
/// The connection is never recycled, otherwise the in-memory database would
/// vanish with it.
pub async fn open_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

/// Current time as unix epoch milliseconds, the storage representation of timestamps
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::InvalidValue(format!("timestamp out of range: {}", ms)))
}
