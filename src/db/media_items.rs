//! Media item repository
//!
//! Rows are keyed by `(integration_instance_id, external_key)`. Every write keeps the
//! `media_items_fts` shadow index in step: the FTS row shares the item's rowid and is
//! replaced in the same transaction.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::sqlite_helpers::{json_to_vec, now_unix, prepare_fts_query, vec_to_json};
use crate::media::{CanonicalMediaItem, ExternalId};

/// Media item record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MediaItemRecord {
    pub id: i64,
    pub integration_instance_id: String,
    pub external_key: String,
    pub section_key: String,
    pub media_type: String,
    pub title: String,
    pub original_title: Option<String>,
    pub sort_title: Option<String>,
    pub year: Option<i32>,
    pub thumb_path: Option<String>,
    pub art_path: Option<String>,
    pub summary: Option<String>,
    /// JSON array
    pub genres: String,
    pub studio: Option<String>,
    pub director: Option<String>,
    /// JSON array
    pub actors: String,
    pub rating: Option<f64>,
    pub content_rating: Option<String>,
    pub duration_ms: Option<i64>,
    pub added_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub indexed_at: i64,
}

impl MediaItemRecord {
    pub fn genres(&self) -> Vec<String> {
        json_to_vec(&self.genres)
    }

    pub fn actors(&self) -> Vec<String> {
        json_to_vec(&self.actors)
    }
}

/// Item count per media type
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TypeCount {
    pub media_type: String,
    pub count: i64,
}

pub struct MediaItemRepository {
    pool: SqlitePool,
}

impl MediaItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update an item and refresh its FTS row. Returns the row id.
    pub async fn upsert(&self, item: &CanonicalMediaItem) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let now = now_unix();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO media_items (
                integration_instance_id, external_key, section_key, media_type, title,
                original_title, sort_title, year, thumb_path, art_path, summary, genres,
                studio, director, actors, rating, content_rating, duration_ms, added_at,
                updated_at, tmdb_id, imdb_id, indexed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (integration_instance_id, external_key) DO UPDATE SET
                section_key = excluded.section_key,
                media_type = excluded.media_type,
                title = excluded.title,
                original_title = excluded.original_title,
                sort_title = excluded.sort_title,
                year = excluded.year,
                thumb_path = excluded.thumb_path,
                art_path = excluded.art_path,
                summary = excluded.summary,
                genres = excluded.genres,
                studio = excluded.studio,
                director = excluded.director,
                actors = excluded.actors,
                rating = excluded.rating,
                content_rating = excluded.content_rating,
                duration_ms = excluded.duration_ms,
                added_at = excluded.added_at,
                updated_at = excluded.updated_at,
                tmdb_id = excluded.tmdb_id,
                imdb_id = excluded.imdb_id,
                indexed_at = excluded.indexed_at
            RETURNING id
            "#,
        )
        .bind(&item.integration_id)
        .bind(&item.external_key)
        .bind(&item.section_key)
        .bind(item.media_type.as_str())
        .bind(&item.title)
        .bind(&item.original_title)
        .bind(&item.sort_title)
        .bind(item.year)
        .bind(&item.thumb_path)
        .bind(&item.art_path)
        .bind(&item.summary)
        .bind(vec_to_json(&item.genres))
        .bind(&item.studio)
        .bind(&item.director)
        .bind(vec_to_json(&item.actors))
        .bind(item.rating)
        .bind(&item.content_rating)
        .bind(item.duration_ms)
        .bind(item.added_at)
        .bind(item.updated_at)
        .bind(item.external_ids.tmdb_id)
        .bind(&item.external_ids.imdb_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("Failed to upsert media item {}", item.external_key))?;

        sqlx::query("DELETE FROM media_items_fts WHERE rowid = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO media_items_fts (rowid, title, original_title, summary, actors, director)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&item.title)
        .bind(item.original_title.as_deref().unwrap_or_default())
        .bind(item.summary.as_deref().unwrap_or_default())
        .bind(item.actors.join(" "))
        .bind(item.director.as_deref().unwrap_or_default())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Get an item by its identity
    pub async fn get(
        &self,
        integration_id: &str,
        external_key: &str,
    ) -> Result<Option<MediaItemRecord>> {
        let record = sqlx::query_as::<_, MediaItemRecord>(
            "SELECT * FROM media_items WHERE integration_instance_id = ? AND external_key = ?",
        )
        .bind(integration_id)
        .bind(external_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Remove every item owned by an integration. Returns the number of items deleted.
    pub async fn delete_by_integration(&self, integration_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM media_items_fts WHERE rowid IN (
                SELECT id FROM media_items WHERE integration_instance_id = ?
            )
            "#,
        )
        .bind(integration_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM media_items WHERE integration_instance_id = ?")
            .bind(integration_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Remove a single item. Returns false when it did not exist.
    pub async fn delete_item(&self, integration_id: &str, external_key: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM media_items WHERE integration_instance_id = ? AND external_key = ?",
        )
        .bind(integration_id)
        .bind(external_key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM media_items_fts WHERE rowid = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM media_items WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn count_by_integration(&self, integration_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM media_items WHERE integration_instance_id = ?")
                .bind(integration_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Item counts grouped by media type, optionally for one integration
    pub async fn count_by_type(&self, integration_id: Option<&str>) -> Result<Vec<TypeCount>> {
        let counts = sqlx::query_as::<_, TypeCount>(
            r#"
            SELECT media_type, COUNT(*) AS count
            FROM media_items
            WHERE (?1 IS NULL OR integration_instance_id = ?1)
            GROUP BY media_type
            ORDER BY media_type
            "#,
        )
        .bind(integration_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }

    /// Full-text search over title, original title, summary, actors and director.
    ///
    /// Results are ranked by bm25. A query with no searchable terms returns nothing.
    pub async fn search(
        &self,
        query: &str,
        integration_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<MediaItemRecord>> {
        let fts_query = prepare_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, MediaItemRecord>(
            r#"
            SELECT m.*
            FROM media_items m
            JOIN media_items_fts ON media_items_fts.rowid = m.id
            WHERE media_items_fts MATCH ?1
              AND (?2 IS NULL OR m.integration_instance_id = ?2)
            ORDER BY bm25(media_items_fts), m.title
            LIMIT ?3
            "#,
        )
        .bind(fts_query)
        .bind(integration_id)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// All items, across integrations, carrying the given external id
    pub async fn find_by_external_id(&self, id: &ExternalId) -> Result<Vec<MediaItemRecord>> {
        let query = match id {
            ExternalId::Tmdb(tmdb) => {
                sqlx::query_as::<_, MediaItemRecord>(
                    "SELECT * FROM media_items WHERE tmdb_id = ? ORDER BY integration_instance_id, id",
                )
                .bind(*tmdb)
            }
            ExternalId::Imdb(imdb) => {
                sqlx::query_as::<_, MediaItemRecord>(
                    "SELECT * FROM media_items WHERE imdb_id = ? ORDER BY integration_instance_id, id",
                )
                .bind(imdb.clone())
            }
        };

        Ok(query.fetch_all(&self.pool).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::media::{ExternalIds, MediaType};
    use pretty_assertions::assert_eq;

    fn item(integration: &str, key: &str, title: &str) -> CanonicalMediaItem {
        CanonicalMediaItem {
            integration_id: integration.to_string(),
            external_key: key.to_string(),
            section_key: "1".to_string(),
            media_type: MediaType::Movie,
            title: title.to_string(),
            original_title: None,
            sort_title: None,
            year: Some(1999),
            thumb_path: Some(format!("/library/metadata/{}/thumb", key)),
            art_path: None,
            summary: Some("A hacker learns about the true nature of reality".to_string()),
            genres: vec!["Action".to_string(), "Sci-Fi".to_string()],
            studio: None,
            director: Some("Lana Wachowski".to_string()),
            actors: vec!["Keanu Reeves".to_string(), "Carrie-Anne Moss".to_string()],
            rating: Some(8.7),
            content_rating: Some("R".to_string()),
            duration_ms: Some(8_160_000),
            added_at: Some(1_700_000_000),
            updated_at: None,
            external_ids: ExternalIds {
                tmdb_id: Some(603),
                imdb_id: Some("tt0133093".to_string()),
            },
        }
    }

    async fn fts_rows(db: &crate::db::Database) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM media_items_fts")
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_keeps_fts_in_step() {
        let db = test_db().await;
        let repo = db.media_items();

        let first = repo.upsert(&item("plex-1", "100", "The Matrix")).await.unwrap();
        let mut renamed = item("plex-1", "100", "The Matrix (Remastered)");
        renamed.genres = vec!["Action".to_string()];
        let second = repo.upsert(&renamed).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.count_by_integration("plex-1").await.unwrap(), 1);
        assert_eq!(fts_rows(&db).await, 1);

        let stored = repo.get("plex-1", "100").await.unwrap().unwrap();
        assert_eq!(stored.title, "The Matrix (Remastered)");
        assert_eq!(stored.genres(), vec!["Action"]);
        assert_eq!(stored.actors(), vec!["Keanu Reeves", "Carrie-Anne Moss"]);
        assert_eq!(stored.tmdb_id, Some(603));

        // old title no longer matches, new one does
        assert_eq!(repo.search("remastered", None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_matches_actor_and_filters_integration() {
        let db = test_db().await;
        let repo = db.media_items();
        repo.upsert(&item("plex-1", "100", "The Matrix")).await.unwrap();
        repo.upsert(&item("jf-1", "abc", "The Matrix")).await.unwrap();
        let mut other = item("plex-1", "200", "Heat");
        other.actors = vec!["Al Pacino".to_string()];
        other.summary = None;
        other.director = Some("Michael Mann".to_string());
        repo.upsert(&other).await.unwrap();

        assert_eq!(repo.search("keanu", None, 10).await.unwrap().len(), 2);
        let scoped = repo.search("keanu", Some("jf-1"), 10).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].external_key, "abc");

        let heat = repo.search("pac", None, 10).await.unwrap();
        assert_eq!(heat.len(), 1);
        assert_eq!(heat[0].title, "Heat");

        assert!(repo.search("\"*", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_integration_scopes_rows() {
        let db = test_db().await;
        let repo = db.media_items();
        for i in 0..3 {
            repo.upsert(&item("plex-1", &i.to_string(), "Movie")).await.unwrap();
        }
        repo.upsert(&item("jf-1", "x", "Movie")).await.unwrap();

        assert_eq!(repo.delete_by_integration("plex-1").await.unwrap(), 3);
        assert_eq!(repo.count_by_integration("plex-1").await.unwrap(), 0);
        assert_eq!(repo.count_by_integration("jf-1").await.unwrap(), 1);
        assert_eq!(fts_rows(&db).await, 1);
    }

    #[tokio::test]
    async fn test_delete_item() {
        let db = test_db().await;
        let repo = db.media_items();
        repo.upsert(&item("plex-1", "100", "The Matrix")).await.unwrap();

        assert!(repo.delete_item("plex-1", "100").await.unwrap());
        assert!(!repo.delete_item("plex-1", "100").await.unwrap());
        assert_eq!(fts_rows(&db).await, 0);
    }

    #[tokio::test]
    async fn test_find_by_external_id_and_count_by_type() {
        let db = test_db().await;
        let repo = db.media_items();
        repo.upsert(&item("plex-1", "100", "The Matrix")).await.unwrap();
        repo.upsert(&item("jf-1", "abc", "The Matrix")).await.unwrap();
        let mut show = item("jf-1", "def", "Severance");
        show.media_type = MediaType::Show;
        show.external_ids = ExternalIds {
            tmdb_id: Some(95396),
            imdb_id: None,
        };
        repo.upsert(&show).await.unwrap();

        let by_tmdb = repo.find_by_external_id(&ExternalId::Tmdb(603)).await.unwrap();
        assert_eq!(by_tmdb.len(), 2);
        let by_imdb = repo
            .find_by_external_id(&ExternalId::Imdb("tt0133093".to_string()))
            .await
            .unwrap();
        assert_eq!(by_imdb.len(), 2);

        assert_eq!(
            repo.count_by_type(Some("jf-1")).await.unwrap(),
            vec![
                TypeCount {
                    media_type: "movie".to_string(),
                    count: 1
                },
                TypeCount {
                    media_type: "show".to_string(),
                    count: 1
                },
            ]
        );
        assert_eq!(repo.count_by_type(None).await.unwrap()[0].count, 2);
    }
}
