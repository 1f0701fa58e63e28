//! The host's persistence layer: registered services and their stored
//! logs.
//!
//! The server consumes these as trait objects, so any store honoring the
//! contract can stand in; the [`SqlitePool`] implementation here is the
//! reference.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use thiserror::Error;

pub use super::connect_sqlite;
use super::SqlitePool;

type Result<T> = std::result::Result<T, Error>;

/// An error when accessing the host store.
#[derive(Debug, Error)]
pub enum Error {
    /// An update was attempted on a service that was never inserted.
    #[error("invalid id")]
    InvalidId,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// One registered producer: a `(machine, name)` identity bound to the
/// fingerprint of the certificate it connects with.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Service {
    /// Assigned by [`ServiceRepository::insert`]; zero until then.
    pub id: i64,
    pub machine: String,
    pub name: String,
    /// Advances on every heartbeat and accepted message.
    pub last_seen: DateTime<Utc>,
    /// Certificate fingerprint currently bound to this identity. Unique
    /// across all services.
    pub sig_hash: String,
}

impl Service {
    pub fn new(machine: &str, name: &str, sig_hash: &str) -> Self {
        Service {
            id: 0,
            machine: machine.to_string(),
            name: name.to_string(),
            last_seen: Utc::now(),
            sig_hash: sig_hash.to_string(),
        }
    }
}

#[async_trait]
pub trait ServiceRepository: Send + Sync {
    /// Perform the DB migrations defined in src/database/migrations/host/*.sql
    async fn migrate(&self) -> Result<()>;

    async fn get_by_hash(&self, hash: &str) -> Result<Option<Service>>;

    async fn get_by_name(&self, machine: &str, name: &str) -> Result<Option<Service>>;

    /// Insert a new service, filling in its `id`.
    async fn insert(&self, service: &mut Service) -> Result<()>;

    /// Write `machine`, `name`, and a fresh `last_seen` for an existing
    /// service.
    async fn update(&self, service: &Service) -> Result<()>;

    /// Rebind an existing identity to a new certificate fingerprint.
    async fn update_hash(&self, id: i64, hash: &str) -> Result<()>;

    async fn update_last_seen(&self, id: i64) -> Result<()>;
}

#[async_trait]
pub trait LogRepository: Send + Sync {
    async fn insert(
        &self,
        service_id: i64,
        log_type: &str,
        log_time: DateTime<Utc>,
        message: &[u8],
        context: &[u8],
    ) -> Result<()>;
}

const SERVICE_COLUMNS: &str = "id, machine, name, last_seen, sig_hash";

#[async_trait]
impl ServiceRepository for SqlitePool {
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("src/database/migrations/host")
            .run(self)
            .await?;
        Ok(())
    }

    async fn get_by_hash(&self, hash: &str) -> Result<Option<Service>> {
        let service = sqlx::query_as::<_, Service>(&format!(
            "SELECT {} FROM services WHERE sig_hash = ?",
            SERVICE_COLUMNS
        ))
        .bind(hash)
        .fetch_optional(self)
        .await?;
        Ok(service)
    }

    async fn get_by_name(&self, machine: &str, name: &str) -> Result<Option<Service>> {
        let service = sqlx::query_as::<_, Service>(&format!(
            "SELECT {} FROM services WHERE machine = ? AND name = ?",
            SERVICE_COLUMNS
        ))
        .bind(machine)
        .bind(name)
        .fetch_optional(self)
        .await?;
        Ok(service)
    }

    async fn insert(&self, service: &mut Service) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO services (machine, name, last_seen, sig_hash)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&service.machine)
        .bind(&service.name)
        .bind(service.last_seen)
        .bind(&service.sig_hash)
        .execute(self)
        .await?;

        service.id = result.last_insert_rowid();
        Ok(())
    }

    async fn update(&self, service: &Service) -> Result<()> {
        if service.id == 0 {
            return Err(Error::InvalidId);
        }
        sqlx::query("UPDATE services SET machine = ?, name = ?, last_seen = ? WHERE id = ?")
            .bind(&service.machine)
            .bind(&service.name)
            .bind(Utc::now())
            .bind(service.id)
            .execute(self)
            .await?;
        Ok(())
    }

    async fn update_hash(&self, id: i64, hash: &str) -> Result<()> {
        if id == 0 {
            return Err(Error::InvalidId);
        }
        sqlx::query("UPDATE services SET sig_hash = ? WHERE id = ?")
            .bind(hash)
            .bind(id)
            .execute(self)
            .await?;
        Ok(())
    }

    async fn update_last_seen(&self, id: i64) -> Result<()> {
        if id == 0 {
            return Err(Error::InvalidId);
        }
        sqlx::query("UPDATE services SET last_seen = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(self)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LogRepository for SqlitePool {
    async fn insert(
        &self,
        service_id: i64,
        log_type: &str,
        log_time: DateTime<Utc>,
        message: &[u8],
        context: &[u8],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO logs (service_id, log_type, log_time, message, context)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(service_id)
        .bind(log_type)
        .bind(log_time)
        .bind(message)
        .bind(context)
        .execute(self)
        .await?;
        Ok(())
    }
}

/// Count of stored log rows for one service; a test and operator
/// convenience, not part of the repository contract.
pub async fn count_logs(pool: &SqlitePool, service_id: i64) -> Result<u64> {
    let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM logs WHERE service_id = ?")
        .bind(service_id)
        .fetch_one(pool)
        .await?
        .get("n");
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_sqlite_in_memory;

    async fn create_migrated_db() -> SqlitePool {
        let pool = connect_sqlite_in_memory().await.unwrap();
        ServiceRepository::migrate(&pool).await.unwrap();
        pool
    }

    async fn service_count(pool: &SqlitePool) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM services")
            .fetch_one(pool)
            .await
            .unwrap()
            .get("n")
    }

    #[tokio::test]
    async fn insert_fills_id_and_lookups_agree() {
        let pool = create_migrated_db().await;

        let mut service = Service::new("web-1", "api", "hash-1");
        ServiceRepository::insert(&pool, &mut service).await.unwrap();
        assert_ne!(service.id, 0);

        let by_hash = pool.get_by_hash("hash-1").await.unwrap().unwrap();
        let by_name = pool.get_by_name("web-1", "api").await.unwrap().unwrap();
        assert_eq!(by_hash, by_name);
        assert_eq!(by_hash.id, service.id);
    }

    #[tokio::test]
    async fn missing_lookups_are_not_errors() {
        let pool = create_migrated_db().await;
        assert!(pool.get_by_hash("nope").await.unwrap().is_none());
        assert!(pool.get_by_name("nope", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_hash_is_rejected() {
        let pool = create_migrated_db().await;

        let mut first = Service::new("web-1", "api", "hash-1");
        ServiceRepository::insert(&pool, &mut first).await.unwrap();

        let mut second = Service::new("web-2", "worker", "hash-1");
        assert!(ServiceRepository::insert(&pool, &mut second).await.is_err());
    }

    #[tokio::test]
    async fn update_renames_in_place() {
        let pool = create_migrated_db().await;

        let mut service = Service::new("web-1", "api", "hash-1");
        ServiceRepository::insert(&pool, &mut service).await.unwrap();

        service.machine = "web-2".to_string();
        service.name = "worker".to_string();
        pool.update(&service).await.unwrap();

        let reloaded = pool.get_by_hash("hash-1").await.unwrap().unwrap();
        assert_eq!(reloaded.machine, "web-2");
        assert_eq!(reloaded.name, "worker");
        assert_eq!(service_count(&pool).await, 1);
    }

    #[tokio::test]
    async fn update_hash_rebinds_identity() {
        let pool = create_migrated_db().await;

        let mut service = Service::new("web-1", "api", "hash-1");
        ServiceRepository::insert(&pool, &mut service).await.unwrap();

        pool.update_hash(service.id, "hash-2").await.unwrap();

        assert!(pool.get_by_hash("hash-1").await.unwrap().is_none());
        let rebound = pool.get_by_hash("hash-2").await.unwrap().unwrap();
        assert_eq!(rebound.id, service.id);
        assert_eq!(service_count(&pool).await, 1);
    }

    #[tokio::test]
    async fn last_seen_advances() {
        let pool = create_migrated_db().await;

        let mut service = Service::new("web-1", "api", "hash-1");
        ServiceRepository::insert(&pool, &mut service).await.unwrap();
        let before = pool.get_by_hash("hash-1").await.unwrap().unwrap().last_seen;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        pool.update_last_seen(service.id).await.unwrap();

        let after = pool.get_by_hash("hash-1").await.unwrap().unwrap().last_seen;
        assert!(after > before);
    }

    #[tokio::test]
    async fn updates_demand_an_inserted_service() {
        let pool = create_migrated_db().await;
        let unsaved = Service::new("web-1", "api", "hash-1");

        assert!(matches!(pool.update(&unsaved).await, Err(Error::InvalidId)));
        assert!(matches!(
            pool.update_hash(0, "hash-2").await,
            Err(Error::InvalidId)
        ));
        assert!(matches!(
            pool.update_last_seen(0).await,
            Err(Error::InvalidId)
        ));
    }

    #[tokio::test]
    async fn logs_persist_against_their_service() {
        let pool = create_migrated_db().await;

        let mut service = Service::new("web-1", "api", "hash-1");
        ServiceRepository::insert(&pool, &mut service).await.unwrap();

        LogRepository::insert(&pool, service.id, "X", Utc::now(), b"hello", b"{\"a\":1}")
            .await
            .unwrap();
        LogRepository::insert(&pool, service.id, "Y", Utc::now(), b"again", b"null")
            .await
            .unwrap();

        assert_eq!(count_logs(&pool, service.id).await.unwrap(), 2);
        assert_eq!(count_logs(&pool, service.id + 1).await.unwrap(), 0);
    }
}
