pub mod jobs;
pub mod migration;
pub mod query;
pub mod schema;
pub mod search_index;
pub mod sessions;

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::models::{JobRecord, StoredJob};
use schema::{MetaKey, SchemaType};

const MEMORY_PATH: &str = ":memory:";

pub(crate) const JOB_COLUMNS: &str =
    "json_data, salary_min_yearly, salary_max_yearly, first_seen, last_seen, created_at, updated_at";

pub struct Database {
    conn: Connection,
    path: PathBuf,
    backup_dir: Option<PathBuf>,
    layout: SchemaType,
}

impl Database {
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.db_path)?;
        conn.busy_timeout(config.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init(conn, config.db_path.clone(), config.backup_dir.clone())
    }

    pub fn open_at(path: impl AsRef<Path>) -> StoreResult<Self> {
        let config = StoreConfig::default().with_db_path(path.as_ref());
        Self::open(&config)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn, PathBuf::from(MEMORY_PATH), None)
    }

    fn init(conn: Connection, path: PathBuf, backup_dir: Option<PathBuf>) -> StoreResult<Self> {
        schema::ensure_meta(&conn)?;
        let layout = schema::detect_schema_type(&conn)?;
        let mut db = Self {
            conn,
            path,
            backup_dir,
            layout,
        };

        match layout {
            SchemaType::Empty | SchemaType::JsonPrimary => {
                db.create_json_schema()?;
                db.reconcile_search_index()?;
            }
            SchemaType::Columnar => {
                info!(
                    path = %db.path.display(),
                    "legacy columnar layout detected; read-only until migrated"
                );
            }
        }
        debug!(path = %db.path.display(), layout = %db.layout, "database opened");
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_PATH
    }

    /// Layout as of the last open, migration or rollback.
    pub fn schema_type(&self) -> SchemaType {
        self.layout
    }

    /// Re-inspect the table structure. Reads no rows.
    pub fn detect_schema_type(&self) -> StoreResult<SchemaType> {
        schema::detect_schema_type(&self.conn)
    }

    /// Create the JSON-primary tables, indexes and metadata if missing.
    ///
    /// Refuses to touch a store that still holds legacy columnar rows; those
    /// go through [`Database::migrate_to_json_schema`].
    pub fn create_json_schema(&mut self) -> StoreResult<()> {
        let found = schema::detect_schema_type(&self.conn)?;
        if found == SchemaType::Columnar {
            return Err(StoreError::LayoutMismatch {
                expected: SchemaType::JsonPrimary,
                found,
            });
        }
        let tx = self.conn.transaction()?;
        schema::create_json_schema(&tx)?;
        tx.commit()?;
        self.layout = SchemaType::JsonPrimary;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> StoreResult<Option<StoredJob>> {
        match self.layout {
            SchemaType::JsonPrimary => load_job(&self.conn, job_id),
            SchemaType::Columnar => migration::read_legacy_job(&self.conn, job_id),
            SchemaType::Empty => Ok(None),
        }
    }

    pub fn count_jobs(&self) -> StoreResult<i64> {
        if self.layout == SchemaType::Empty {
            return Ok(0);
        }
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?)
    }

    pub(crate) fn require_layout(&self, expected: SchemaType) -> StoreResult<()> {
        if self.layout != expected {
            return Err(StoreError::LayoutMismatch {
                expected,
                found: self.layout,
            });
        }
        Ok(())
    }

    /// Open the single write transaction every mutation goes through.
    ///
    /// Fails while a migration is recorded as running, and on any layout other
    /// than JSON-primary. Any write also closes the post-commit rollback window.
    pub(crate) fn begin_write(&mut self) -> StoreResult<Transaction<'_>> {
        let layout = self.layout;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if schema::migration_running(&tx)? {
            return Err(StoreError::MigrationInProgress);
        }
        if layout != SchemaType::JsonPrimary {
            return Err(StoreError::LayoutMismatch {
                expected: SchemaType::JsonPrimary,
                found: layout,
            });
        }
        tx.execute(
            "UPDATE schema_meta SET value = 'closed' WHERE key = ?1 AND value = 'open'",
            [MetaKey::RollbackWindow.as_str()],
        )?;
        Ok(tx)
    }
}

/// Raw `jobs` row; timestamps are converted outside the rusqlite closure.
pub(crate) struct JobRow {
    json_data: String,
    salary_min_yearly: Option<i64>,
    salary_max_yearly: Option<i64>,
    first_seen: String,
    last_seen: String,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    pub(crate) fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            json_data: row.get(0)?,
            salary_min_yearly: row.get(1)?,
            salary_max_yearly: row.get(2)?,
            first_seen: row.get(3)?,
            last_seen: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    pub(crate) fn into_stored(self) -> StoreResult<StoredJob> {
        let doc: serde_json::Value = serde_json::from_str(&self.json_data)?;
        Ok(StoredJob {
            record: JobRecord::from_document(&doc)?,
            salary_min_yearly: self.salary_min_yearly,
            salary_max_yearly: self.salary_max_yearly,
            first_seen: stored_ts(&self.first_seen)?,
            last_seen: stored_ts(&self.last_seen)?,
            created_at: stored_ts(&self.created_at)?,
            updated_at: stored_ts(&self.updated_at)?,
        })
    }
}

pub(crate) fn load_job(conn: &Connection, job_id: &str) -> StoreResult<Option<StoredJob>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM jobs WHERE job_id = ?1", JOB_COLUMNS),
            [job_id],
            JobRow::from_row,
        )
        .optional()?;
    row.map(JobRow::into_stored).transpose()
}

/// Write a document back together with its storage timestamps.
pub(crate) fn write_job(conn: &Connection, job: &StoredJob) -> StoreResult<()> {
    let json = serde_json::to_string(&job.record.to_document())?;
    let updated = conn.execute(
        "UPDATE jobs SET json_data = ?1, last_seen = ?2, updated_at = ?3 WHERE job_id = ?4",
        rusqlite::params![
            json,
            format_ts(job.last_seen),
            format_ts(job.updated_at),
            job.record.job_id
        ],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO jobs (json_data, first_seen, last_seen, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                json,
                format_ts(job.first_seen),
                format_ts(job.last_seen),
                format_ts(job.created_at),
                format_ts(job.updated_at)
            ],
        )?;
    }
    Ok(())
}

// --- Timestamps ---
//
// Stored as fixed-width RFC 3339 UTC with microseconds, so string order in
// SQL is chronological order.

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts our own format and SQLite's `CURRENT_TIMESTAMP` style.
pub(crate) fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc).trunc_subsecs(6));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc().trunc_subsecs(6))
}

fn stored_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    parse_ts(raw).ok_or_else(|| {
        StoreError::Validation(format!("unreadable timestamp '{}' in jobs table", raw))
    })
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The current time, or one microsecond past `floor` if the clock has not
/// moved beyond it.
pub(crate) fn now_after(floor: DateTime<Utc>) -> DateTime<Utc> {
    let now = now();
    if now > floor {
        now
    } else {
        floor + Duration::microseconds(1)
    }
}
