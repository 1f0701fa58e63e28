//! The agent's durable spool: every record survives here from the moment
//! [`Spool::put`] returns until the host acknowledges it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

pub use super::connect_sqlite;
use super::SqlitePool;

type Result<T> = std::result::Result<T, Error>;

/// An error when accessing the spool.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// One log record awaiting acknowledgment from the host.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SpoolRecord {
    /// Locally generated unique id; the correlation handle for acks.
    pub id: String,
    pub log_type: String,
    pub log_time: DateTime<Utc>,
    pub message: Vec<u8>,
    pub context: Vec<u8>,
}

impl SpoolRecord {
    pub fn new(
        log_type: impl Into<String>,
        log_time: DateTime<Utc>,
        message: Vec<u8>,
        context: Vec<u8>,
    ) -> Self {
        SpoolRecord {
            id: String::new(),
            log_type: log_type.into(),
            log_time,
            message,
            context,
        }
    }
}

#[async_trait]
pub trait Spool: Send + Sync {
    /// Perform the DB migrations defined in src/database/migrations/spool/*.sql
    async fn migrate(&self) -> Result<()>;

    /// Persist a record, assigning it a fresh unique id if it has none.
    /// The record is durable the instant this returns.
    async fn put(&self, record: SpoolRecord) -> Result<String>;

    /// Every stored record whose id is not in `excluding` (the sender's
    /// in-flight set). No ordering is guaranteed.
    async fn list(&self, excluding: &HashSet<String>) -> Result<Vec<SpoolRecord>>;

    /// Remove a record; removing an absent id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Number of records currently spooled.
    async fn pending(&self) -> Result<u64>;
}

#[async_trait]
impl Spool for SqlitePool {
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("src/database/migrations/spool")
            .run(self)
            .await?;
        Ok(())
    }

    async fn put(&self, mut record: SpoolRecord) -> Result<String> {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        sqlx::query(
            "INSERT INTO spool (id, log_type, log_time, message, context)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.log_type)
        .bind(record.log_time)
        .bind(&record.message)
        .bind(&record.context)
        .execute(self)
        .await?;

        Ok(record.id)
    }

    async fn list(&self, excluding: &HashSet<String>) -> Result<Vec<SpoolRecord>> {
        // The exclusion set is in-memory sender state, so filtering happens
        // here rather than in SQL.
        let records = sqlx::query_as::<_, SpoolRecord>(
            "SELECT id, log_type, log_time, message, context FROM spool",
        )
        .fetch_all(self)
        .await?
        .into_iter()
        .filter(|record| !excluding.contains(&record.id))
        .collect();

        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM spool WHERE id = ?")
            .bind(id)
            .execute(self)
            .await?;
        Ok(())
    }

    async fn pending(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM spool")
            .fetch_one(self)
            .await?;
        Ok(count as u64)
    }
}
