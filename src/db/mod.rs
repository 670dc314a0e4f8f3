//! Database connection and repositories
//!
//! SQLite holds the synced library (`media_items` plus its FTS5 shadow index),
//! per-integration sync status, and the configured integrations.

pub mod integrations;
pub mod media_items;
pub mod schema_sync;
pub mod sqlite_helpers;
pub mod sync_status;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{info, warn};

pub use integrations::{IntegrationRecord, IntegrationRepository, UpsertIntegration};
pub use media_items::{MediaItemRecord, MediaItemRepository, TypeCount};
pub use schema_sync::SchemaSyncResult;
pub use sync_status::{SyncState, SyncStatusRecord, SyncStatusRepository};

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the maximum connection pool size from environment or default
    fn get_max_connections() -> u32 {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5)
    }

    fn connect_options(url: &str) -> Result<SqliteConnectOptions> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL: {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        Ok(options)
    }

    /// Create a new database connection pool
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(Self::get_max_connections())
            .connect_with(Self::connect_options(url)?)
            .await
            .with_context(|| format!("Failed to open database {}", url))?;

        Ok(Self { pool })
    }

    /// Connect, retrying every `retry_interval` until `timeout` elapses
    pub async fn connect_with_retry(
        url: &str,
        retry_interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match Self::connect(url).await {
                Ok(db) => return Ok(db),
                Err(e) if tokio::time::Instant::now() + retry_interval < deadline => {
                    warn!(
                        error = %e,
                        retry_in_secs = retry_interval.as_secs(),
                        "Database connection failed, retrying"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Private in-memory database. A single connection that never expires, so the
    /// data lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create missing tables and columns
    pub async fn migrate(&self) -> Result<SchemaSyncResult> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database is not reachable")?;

        let result = schema_sync::sync_all_schemas(&self.pool).await;
        if !result.tables_created.is_empty() {
            info!(tables = ?result.tables_created, "Created tables");
        }
        if !result.columns_added.is_empty() {
            info!(columns = ?result.columns_added, "Added columns");
        }
        for err in &result.errors {
            warn!(error = %err, "Schema sync error");
        }
        Ok(result)
    }

    /// Liveness check used by /readyz
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get an integrations repository
    pub fn integrations(&self) -> IntegrationRepository {
        IntegrationRepository::new(self.pool.clone())
    }

    /// Get a media items repository
    pub fn media_items(&self) -> MediaItemRepository {
        MediaItemRepository::new(self.pool.clone())
    }

    /// Get a sync status repository
    pub fn sync_status(&self) -> SyncStatusRepository {
        SyncStatusRepository::new(self.pool.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;

    /// Migrated in-memory database
    pub async fn test_db() -> Database {
        let db = Database::in_memory().await.unwrap();
        let result = db.migrate().await.unwrap();
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        db
    }
}
