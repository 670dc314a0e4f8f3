//! Automatic schema synchronization
//!
//! Runs at startup:
//! - Creates missing tables (including the FTS5 shadow index)
//! - Adds missing columns to existing tables
//! - Does NOT handle column renames or type changes (requires DB wipe)

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// Result of a schema sync operation
#[derive(Debug, Default)]
pub struct SchemaSyncResult {
    pub tables_created: Vec<String>,
    pub columns_added: Vec<(String, String)>, // (table, column)
    pub errors: Vec<String>,
}

impl SchemaSyncResult {
    fn merge(&mut self, other: SchemaSyncResult) {
        self.tables_created.extend(other.tables_created);
        self.columns_added.extend(other.columns_added);
        self.errors.extend(other.errors);
    }
}

/// Column definition used for additive migrations
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub nullable: bool,
    pub default: Option<&'static str>,
}

const fn col(name: &'static str, sql_type: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        sql_type,
        nullable: true,
        default: None,
    }
}

/// A table owned by this crate
struct TableDef {
    name: &'static str,
    create_sql: &'static [&'static str],
    /// Columns that may be missing from databases created by older builds
    columns: &'static [ColumnDef],
}

const INTEGRATIONS_SQL: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS integrations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        provider_type TEXT NOT NULL,
        base_url TEXT NOT NULL,
        api_token TEXT,
        user_id TEXT,
        library_sync_enabled INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL
    )
"#];

const MEDIA_ITEMS_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS media_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        integration_instance_id TEXT NOT NULL,
        external_key TEXT NOT NULL,
        section_key TEXT NOT NULL,
        media_type TEXT NOT NULL,
        title TEXT NOT NULL,
        original_title TEXT,
        sort_title TEXT,
        year INTEGER,
        thumb_path TEXT,
        art_path TEXT,
        summary TEXT,
        genres TEXT NOT NULL DEFAULT '[]',
        studio TEXT,
        director TEXT,
        actors TEXT NOT NULL DEFAULT '[]',
        rating REAL,
        content_rating TEXT,
        duration_ms INTEGER,
        added_at INTEGER,
        updated_at INTEGER,
        tmdb_id INTEGER,
        imdb_id TEXT,
        indexed_at INTEGER NOT NULL,
        UNIQUE (integration_instance_id, external_key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_media_items_tmdb ON media_items (tmdb_id)",
    "CREATE INDEX IF NOT EXISTS idx_media_items_imdb ON media_items (imdb_id)",
];

const MEDIA_ITEMS_COLUMNS: &[ColumnDef] = &[
    col("original_title", "TEXT"),
    col("sort_title", "TEXT"),
    col("art_path", "TEXT"),
    col("studio", "TEXT"),
    col("content_rating", "TEXT"),
    col("duration_ms", "INTEGER"),
    col("updated_at", "INTEGER"),
    col("tmdb_id", "INTEGER"),
    col("imdb_id", "TEXT"),
];

// rowid of each FTS row is media_items.id
const MEDIA_ITEMS_FTS_SQL: &[&str] = &[r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS media_items_fts USING fts5(
        title,
        original_title,
        summary,
        actors,
        director
    )
"#];

const SYNC_STATUS_SQL: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS sync_status (
        integration_instance_id TEXT PRIMARY KEY,
        total_items INTEGER NOT NULL DEFAULT 0,
        indexed_items INTEGER NOT NULL DEFAULT 0,
        last_sync_started INTEGER,
        last_sync_completed INTEGER,
        state TEXT NOT NULL DEFAULT 'idle',
        error_message TEXT
    )
"#];

const TABLES: &[TableDef] = &[
    TableDef {
        name: "integrations",
        create_sql: INTEGRATIONS_SQL,
        columns: &[],
    },
    TableDef {
        name: "media_items",
        create_sql: MEDIA_ITEMS_SQL,
        columns: MEDIA_ITEMS_COLUMNS,
    },
    TableDef {
        name: "media_items_fts",
        create_sql: MEDIA_ITEMS_FTS_SQL,
        columns: &[],
    },
    TableDef {
        name: "sync_status",
        create_sql: SYNC_STATUS_SQL,
        columns: &[],
    },
];

/// Check if a table exists in the database
pub async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool, sqlx::Error> {
    let result: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table_name)
            .fetch_optional(pool)
            .await?;

    Ok(result.is_some())
}

/// Get existing columns for a table
async fn get_table_columns(
    pool: &SqlitePool,
    table_name: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(i32, String, String, i32, Option<String>, i32)> =
        sqlx::query_as(&format!("PRAGMA table_info({})", table_name))
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().map(|(_, name, _, _, _, _)| name).collect())
}

/// Generate ALTER TABLE ADD COLUMN SQL
fn generate_add_column_sql(table_name: &str, col: &ColumnDef) -> String {
    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table_name, col.name, col.sql_type
    );

    // SQLite cannot add a NOT NULL column without a default
    if let Some(default) = col.default {
        sql.push_str(&format!(" DEFAULT {}", default));
    } else if !col.nullable {
        let default_val = match col.sql_type {
            "TEXT" => "''",
            "INTEGER" => "0",
            "REAL" => "0.0",
            _ => "''",
        };
        sql.push_str(&format!(" NOT NULL DEFAULT {}", default_val));
    }

    sql
}

async fn sync_table(pool: &SqlitePool, table: &TableDef) -> Result<SchemaSyncResult, sqlx::Error> {
    let mut result = SchemaSyncResult::default();

    if !table_exists(pool, table.name).await? {
        for stmt in table.create_sql {
            debug!("Creating {}: {}", table.name, stmt.trim());
            if let Err(e) = sqlx::query(stmt.trim()).execute(pool).await {
                let msg = format!("Failed to create table {}: {}", table.name, e);
                warn!("{}", msg);
                result.errors.push(msg);
                return Ok(result);
            }
        }
        info!("Created table: {}", table.name);
        result.tables_created.push(table.name.to_string());
        return Ok(result);
    }

    // Indexes are idempotent; re-run them for databases created before they existed
    for stmt in table.create_sql.iter().skip(1) {
        if let Err(e) = sqlx::query(stmt.trim()).execute(pool).await {
            let msg = format!("Failed to apply {} statement: {}", table.name, e);
            warn!("{}", msg);
            result.errors.push(msg);
        }
    }

    let existing_columns = get_table_columns(pool, table.name).await?;
    for col_def in table.columns {
        if existing_columns.iter().any(|c| c == col_def.name) {
            continue;
        }
        let alter_sql = generate_add_column_sql(table.name, col_def);
        debug!("Adding column to {}: {}", table.name, alter_sql);

        match sqlx::query(&alter_sql).execute(pool).await {
            Ok(_) => {
                info!("Added column {}.{}", table.name, col_def.name);
                result
                    .columns_added
                    .push((table.name.to_string(), col_def.name.to_string()));
            }
            Err(e) => {
                let msg = format!("Failed to add column {}.{}: {}", table.name, col_def.name, e);
                warn!("{}", msg);
                result.errors.push(msg);
            }
        }
    }

    Ok(result)
}

/// Sync all tables to the database.
///
/// Called at startup so every table exists with the expected columns.
pub async fn sync_all_schemas(pool: &SqlitePool) -> SchemaSyncResult {
    let mut total_result = SchemaSyncResult::default();

    for table in TABLES {
        match sync_table(pool, table).await {
            Ok(result) => total_result.merge(result),
            Err(e) => total_result
                .errors
                .push(format!("Error syncing {}: {}", table.name, e)),
        }
    }

    total_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_generate_add_column_sql() {
        assert_eq!(
            generate_add_column_sql("media_items", &col("studio", "TEXT")),
            "ALTER TABLE media_items ADD COLUMN studio TEXT"
        );
        let not_null = ColumnDef {
            name: "flag",
            sql_type: "INTEGER",
            nullable: false,
            default: None,
        };
        assert_eq!(
            generate_add_column_sql("t", &not_null),
            "ALTER TABLE t ADD COLUMN flag INTEGER NOT NULL DEFAULT 0"
        );
    }

    #[tokio::test]
    async fn test_sync_creates_then_is_idempotent() {
        let db = Database::in_memory().await.unwrap();

        let first = sync_all_schemas(db.pool()).await;
        assert!(first.errors.is_empty(), "{:?}", first.errors);
        assert_eq!(
            first.tables_created,
            vec!["integrations", "media_items", "media_items_fts", "sync_status"]
        );

        let second = sync_all_schemas(db.pool()).await;
        assert!(second.errors.is_empty(), "{:?}", second.errors);
        assert!(second.tables_created.is_empty());
        assert!(second.columns_added.is_empty());
    }

    #[tokio::test]
    async fn test_sync_adds_missing_columns() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query(
            "CREATE TABLE media_items (id INTEGER PRIMARY KEY, integration_instance_id TEXT NOT NULL, \
             external_key TEXT NOT NULL, section_key TEXT NOT NULL, media_type TEXT NOT NULL, \
             title TEXT NOT NULL, year INTEGER, thumb_path TEXT, summary TEXT, \
             genres TEXT NOT NULL DEFAULT '[]', director TEXT, actors TEXT NOT NULL DEFAULT '[]', \
             rating REAL, added_at INTEGER, indexed_at INTEGER NOT NULL)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let result = sync_all_schemas(db.pool()).await;
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert!(
            result
                .columns_added
                .contains(&("media_items".to_string(), "tmdb_id".to_string()))
        );
        assert_eq!(result.columns_added.len(), MEDIA_ITEMS_COLUMNS.len());
    }
}
