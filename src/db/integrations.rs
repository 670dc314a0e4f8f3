//! Integration registry repository
//!
//! An integration is one configured media server (Plex, Jellyfin or Emby).

use anyhow::Result;
use sqlx::SqlitePool;

use super::sqlite_helpers::now_unix;
use crate::services::providers::ProviderKind;

/// Integration record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IntegrationRecord {
    pub id: String,
    pub name: String,
    pub provider_type: String,
    pub base_url: String,
    pub api_token: Option<String>,
    /// Jellyfin/Emby user used for library views
    pub user_id: Option<String>,
    pub library_sync_enabled: bool,
    pub created_at: i64,
}

impl IntegrationRecord {
    /// Provider kind, `None` when the stored type has no sync strategy
    pub fn kind(&self) -> Option<ProviderKind> {
        self.provider_type.parse().ok()
    }
}

/// Input for creating or replacing an integration
#[derive(Debug, Clone)]
pub struct UpsertIntegration {
    pub id: String,
    pub name: String,
    pub provider_type: String,
    pub base_url: String,
    pub api_token: Option<String>,
    pub user_id: Option<String>,
    pub library_sync_enabled: bool,
}

pub struct IntegrationRepository {
    pool: SqlitePool,
}

impl IntegrationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<IntegrationRecord>> {
        let records = sqlx::query_as::<_, IntegrationRecord>(
            "SELECT * FROM integrations ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn list_sync_enabled(&self) -> Result<Vec<IntegrationRecord>> {
        let records = sqlx::query_as::<_, IntegrationRecord>(
            "SELECT * FROM integrations WHERE library_sync_enabled = 1 ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn get(&self, id: &str) -> Result<Option<IntegrationRecord>> {
        let record =
            sqlx::query_as::<_, IntegrationRecord>("SELECT * FROM integrations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    pub async fn upsert(&self, input: UpsertIntegration) -> Result<IntegrationRecord> {
        let record = sqlx::query_as::<_, IntegrationRecord>(
            r#"
            INSERT INTO integrations (
                id, name, provider_type, base_url, api_token, user_id,
                library_sync_enabled, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                provider_type = excluded.provider_type,
                base_url = excluded.base_url,
                api_token = excluded.api_token,
                user_id = excluded.user_id,
                library_sync_enabled = excluded.library_sync_enabled
            RETURNING *
            "#,
        )
        .bind(&input.id)
        .bind(&input.name)
        .bind(&input.provider_type)
        .bind(&input.base_url)
        .bind(&input.api_token)
        .bind(&input.user_id)
        .bind(input.library_sync_enabled)
        .bind(now_unix())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn set_library_sync_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE integrations SET library_sync_enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM integrations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
