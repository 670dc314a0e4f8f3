//! Per-integration sync status repository

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Lifecycle state of an integration's library sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
    Completed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
            SyncState::Completed => "completed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncState::Idle),
            "syncing" => Ok(SyncState::Syncing),
            "error" => Ok(SyncState::Error),
            "completed" => Ok(SyncState::Completed),
            other => Err(format!("unknown sync state '{}'", other)),
        }
    }
}

/// Sync status record from database. Timestamps are epoch seconds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncStatusRecord {
    pub integration_instance_id: String,
    pub total_items: i64,
    pub indexed_items: i64,
    pub last_sync_started: Option<i64>,
    pub last_sync_completed: Option<i64>,
    pub state: String,
    pub error_message: Option<String>,
}

impl SyncStatusRecord {
    /// Unknown values read back as idle
    pub fn sync_state(&self) -> SyncState {
        self.state.parse().unwrap_or(SyncState::Idle)
    }
}

pub struct SyncStatusRepository {
    pool: SqlitePool,
}

impl SyncStatusRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, integration_id: &str) -> Result<Option<SyncStatusRecord>> {
        let record = sqlx::query_as::<_, SyncStatusRecord>(
            "SELECT * FROM sync_status WHERE integration_instance_id = ?",
        )
        .bind(integration_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Enter `syncing` with zeroed counters and a fresh start time
    pub async fn mark_started(&self, integration_id: &str, started_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_status (
                integration_instance_id, total_items, indexed_items,
                last_sync_started, state, error_message
            )
            VALUES (?, 0, 0, ?, 'syncing', NULL)
            ON CONFLICT (integration_instance_id) DO UPDATE SET
                total_items = 0,
                indexed_items = 0,
                last_sync_started = excluded.last_sync_started,
                state = 'syncing',
                error_message = NULL
            "#,
        )
        .bind(integration_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_total(&self, integration_id: &str, total: i64) -> Result<()> {
        sqlx::query("UPDATE sync_status SET total_items = ? WHERE integration_instance_id = ?")
            .bind(total)
            .bind(integration_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn update_progress(&self, integration_id: &str, indexed: i64) -> Result<()> {
        sqlx::query("UPDATE sync_status SET indexed_items = ? WHERE integration_instance_id = ?")
            .bind(indexed)
            .bind(integration_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Persist the terminal state of a run. `indexed` of `None` keeps the last
    /// persisted progress.
    pub async fn finish(
        &self,
        integration_id: &str,
        state: SyncState,
        indexed: Option<i64>,
        error_message: Option<&str>,
        completed_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_status
            SET state = ?,
                indexed_items = COALESCE(?, indexed_items),
                error_message = ?,
                last_sync_completed = COALESCE(?, last_sync_completed)
            WHERE integration_instance_id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(indexed)
        .bind(error_message)
        .bind(completed_at)
        .bind(integration_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Integrations whose last persisted state is `syncing`
    pub async fn list_syncing(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT integration_instance_id FROM sync_status WHERE state = 'syncing' ORDER BY integration_instance_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    pub async fn delete(&self, integration_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_status WHERE integration_instance_id = ?")
            .bind(integration_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;

    #[tokio::test]
    async fn test_status_lifecycle() {
        let db = test_db().await;
        let repo = db.sync_status();
        assert!(repo.get("plex-1").await.unwrap().is_none());

        repo.mark_started("plex-1", 100).await.unwrap();
        repo.set_total("plex-1", 150).await.unwrap();
        repo.update_progress("plex-1", 42).await.unwrap();

        let status = repo.get("plex-1").await.unwrap().unwrap();
        assert_eq!(status.sync_state(), SyncState::Syncing);
        assert_eq!(status.total_items, 150);
        assert_eq!(status.indexed_items, 42);
        assert_eq!(status.last_sync_started, Some(100));

        repo.finish("plex-1", SyncState::Completed, Some(150), None, Some(200))
            .await
            .unwrap();
        let status = repo.get("plex-1").await.unwrap().unwrap();
        assert_eq!(status.sync_state(), SyncState::Completed);
        assert_eq!(status.last_sync_completed, Some(200));

        // restart clears counters and error but keeps the last completion time
        repo.finish("plex-1", SyncState::Error, None, Some("boom"), None)
            .await
            .unwrap();
        repo.mark_started("plex-1", 300).await.unwrap();
        let status = repo.get("plex-1").await.unwrap().unwrap();
        assert_eq!(status.indexed_items, 0);
        assert_eq!(status.error_message, None);
        assert_eq!(status.last_sync_completed, Some(200));
    }

    #[tokio::test]
    async fn test_list_syncing_and_error_keeps_progress() {
        let db = test_db().await;
        let repo = db.sync_status();
        repo.mark_started("a", 1).await.unwrap();
        repo.update_progress("a", 7).await.unwrap();
        repo.mark_started("b", 1).await.unwrap();
        repo.finish("b", SyncState::Completed, Some(0), None, Some(2))
            .await
            .unwrap();

        assert_eq!(repo.list_syncing().await.unwrap(), vec!["a".to_string()]);

        repo.finish("a", SyncState::Error, None, Some("restarted"), None)
            .await
            .unwrap();
        let a = repo.get("a").await.unwrap().unwrap();
        assert_eq!(a.sync_state(), SyncState::Error);
        assert_eq!(a.indexed_items, 7);
        assert_eq!(a.error_message.as_deref(), Some("restarted"));
        assert!(repo.list_syncing().await.unwrap().is_empty());

        assert!(repo.delete("a").await.unwrap());
        assert!(!repo.delete("a").await.unwrap());
    }
}
