//! Storage layouts and the schema metadata record.
//!
//! The JSON-primary layout keeps one document per row in `jobs.json_data`;
//! every queryable column is a SQLite generated column over that document.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreResult;

pub const JSON_SCHEMA_VERSION: i64 = 2;

/// Columns of the legacy column-oriented `jobs` table.
pub const LEGACY_COLUMNS: [&str; 17] = [
    "job_id",
    "title",
    "company",
    "work_type",
    "location",
    "salary",
    "benefits",
    "url",
    "description",
    "status",
    "source",
    "salary_min_yearly",
    "salary_max_yearly",
    "first_seen",
    "last_seen",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaType {
    Columnar,
    JsonPrimary,
    Empty,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Columnar => "columnar",
            SchemaType::JsonPrimary => "json_primary",
            SchemaType::Empty => "empty",
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    Layout,
    SchemaVersion,
    MigrationState,
    BackupPath,
    RollbackWindow,
    MigratedAt,
    LastMigrationError,
}

impl MetaKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaKey::Layout => "layout",
            MetaKey::SchemaVersion => "schema_version",
            MetaKey::MigrationState => "migration_state",
            MetaKey::BackupPath => "backup_path",
            MetaKey::RollbackWindow => "rollback_window",
            MetaKey::MigratedAt => "migrated_at",
            MetaKey::LastMigrationError => "last_migration_error",
        }
    }
}

pub fn ensure_meta(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

pub fn meta_get(conn: &Connection, key: MetaKey) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = ?1",
            [key.as_str()],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn meta_set(conn: &Connection, key: MetaKey, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key.as_str(), value],
    )?;
    Ok(())
}

pub fn meta_clear(conn: &Connection, key: MetaKey) -> StoreResult<()> {
    conn.execute("DELETE FROM schema_meta WHERE key = ?1", [key.as_str()])?;
    Ok(())
}

pub(crate) fn migration_running(conn: &Connection) -> StoreResult<bool> {
    Ok(meta_get(conn, MetaKey::MigrationState)?.as_deref() == Some("migrating"))
}

/// All column names of `table`, generated columns included.
pub fn table_columns(conn: &Connection, table: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_xinfo(?1)")?;
    let rows = stmt.query_map([table], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Structural check only; no row of `jobs` is read.
pub fn detect_schema_type(conn: &Connection) -> StoreResult<SchemaType> {
    let columns = table_columns(conn, "jobs")?;
    if columns.is_empty() {
        Ok(SchemaType::Empty)
    } else if columns.iter().any(|c| c == "json_data") {
        Ok(SchemaType::JsonPrimary)
    } else {
        Ok(SchemaType::Columnar)
    }
}

pub fn create_json_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            json_data TEXT NOT NULL
                CHECK (json_valid(json_data))
                CHECK (json_type(json_data, '$.job_id') IS 'text'),
            job_id TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.job_id')) VIRTUAL,
            title TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.title')) VIRTUAL,
            company TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.company')) VIRTUAL,
            work_type TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.work_type')) VIRTUAL,
            location TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.location')) VIRTUAL,
            salary TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.salary')) VIRTUAL,
            benefits TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.benefits')) VIRTUAL,
            url TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.url')) VIRTUAL,
            description TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.description')) VIRTUAL,
            status TEXT GENERATED ALWAYS AS (COALESCE(json_extract(json_data, '$.status'), 'active')) VIRTUAL,
            source TEXT GENERATED ALWAYS AS (json_extract(json_data, '$.source')) VIRTUAL,
            salary_min_yearly INTEGER GENERATED ALWAYS AS (json_extract(json_data, '$.salary_min_yearly')) VIRTUAL,
            salary_max_yearly INTEGER GENERATED ALWAYS AS (json_extract(json_data, '$.salary_max_yearly')) VIRTUAL,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_job_id ON jobs(job_id);
        CREATE INDEX IF NOT EXISTS idx_jobs_location ON jobs(location);

        CREATE VIRTUAL TABLE IF NOT EXISTS jobs_fts USING fts5(
            job_id UNINDEXED,
            title,
            company,
            description,
            synced_at UNINDEXED
        );

        CREATE TABLE IF NOT EXISTS scrape_sessions (
            session_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            jobs_seen INTEGER NOT NULL DEFAULT 0,
            jobs_new INTEGER NOT NULL DEFAULT 0,
            jobs_updated INTEGER NOT NULL DEFAULT 0,
            jobs_removed INTEGER NOT NULL DEFAULT 0,
            source TEXT,
            search_criteria TEXT,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS job_session_mapping (
            job_id TEXT NOT NULL,
            session_id INTEGER NOT NULL REFERENCES scrape_sessions(session_id) ON DELETE CASCADE,
            position_in_results INTEGER NOT NULL,
            PRIMARY KEY (job_id, session_id)
        );
        "#,
    )?;

    meta_set(conn, MetaKey::Layout, SchemaType::JsonPrimary.as_str())?;
    meta_set(
        conn,
        MetaKey::SchemaVersion,
        &JSON_SCHEMA_VERSION.to_string(),
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES (?1, 'not_started')",
        [MetaKey::MigrationState.as_str()],
    )?;
    conn.pragma_update(None, "user_version", JSON_SCHEMA_VERSION)?;
    Ok(())
}
