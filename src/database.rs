pub mod host;
pub mod spool;
pub use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::sqlite::SqliteSynchronous;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where a store lives: a SQLite file, or in memory for tests and
/// throwaway deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseLocation {
    Ephemeral,
    Sqlite(PathBuf),
}

impl DatabaseLocation {
    pub fn relative_to(self, path: impl AsRef<Path>) -> Self {
        if let DatabaseLocation::Sqlite(db_path) = self {
            DatabaseLocation::Sqlite(path.as_ref().join(db_path))
        } else {
            self
        }
    }

    pub async fn connect(&self) -> Result<SqlitePool, anyhow::Error> {
        match self {
            DatabaseLocation::Ephemeral => connect_sqlite_in_memory().await,
            DatabaseLocation::Sqlite(path) => connect_sqlite(path).await,
        }
    }
}

pub async fn connect_sqlite<T: AsRef<Path>>(path: T) -> Result<SqlitePool, anyhow::Error> {
    // Spooled records must survive a hard kill the moment a write returns.
    let options = SqliteConnectOptions::new()
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Full)
        .filename(path.as_ref());

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| {
            format!(
                "Could not open SQLite database at \"{}\"",
                path.as_ref().display()
            )
        })?;

    Ok(pool)
}

pub async fn connect_sqlite_in_memory() -> Result<SqlitePool, anyhow::Error> {
    // A single immortal connection: the database lives exactly as long as
    // the pool holds it open.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .context("Could not open in-memory SQLite database")?;

    Ok(pool)
}
