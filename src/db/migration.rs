//! One-way move from the legacy columnar layout to the JSON-primary layout.
//!
//! The sequence is backup, safety check, conversion in one EXCLUSIVE
//! transaction, verification. Progress is recorded in `schema_meta` so a
//! crash mid-way is visible on the next open; the only way out of a failed
//! run is [`Database::rollback_migration`].

use chrono::{DateTime, Utc};
use rusqlite::backup::Progress;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::schema::{self, LEGACY_COLUMNS, MetaKey, SchemaType, meta_clear, meta_get, meta_set};
use super::{Database, format_ts, now, parse_ts, search_index, write_job};
use crate::error::{StoreError, StoreResult};
use crate::models::{JobRecord, JobStatus, StoredJob};

const LEGACY_TABLES: [&str; 3] = ["jobs", "scrape_sessions", "job_session_mapping"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    NotStarted,
    BackedUp,
    Validated,
    Migrating,
    Committed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::NotStarted => "not_started",
            MigrationState::BackedUp => "backed_up",
            MigrationState::Validated => "validated",
            MigrationState::Migrating => "migrating",
            MigrationState::Committed => "committed",
        }
    }

    fn from_meta(raw: Option<&str>) -> Self {
        match raw {
            Some("backed_up") => MigrationState::BackedUp,
            Some("validated") => MigrationState::Validated,
            Some("migrating") => MigrationState::Migrating,
            Some("committed") => MigrationState::Committed,
            _ => MigrationState::NotStarted,
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A condition that stops a migration before any row is touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationBlocker {
    InsufficientDiskSpace {
        required_bytes: u64,
        available_bytes: u64,
    },
    MigrationInProgress,
    AlreadyJsonPrimary,
    EmptyStore,
    MissingKeyColumn,
    MissingColumns {
        columns: Vec<String>,
    },
    NoVerifiedBackup,
}

impl fmt::Display for MigrationBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationBlocker::InsufficientDiskSpace {
                required_bytes,
                available_bytes,
            } => write!(
                f,
                "insufficient disk space ({} bytes needed, {} available)",
                required_bytes, available_bytes
            ),
            MigrationBlocker::MigrationInProgress => {
                f.write_str("a previous migration did not finish; roll it back first")
            }
            MigrationBlocker::AlreadyJsonPrimary => f.write_str("store already uses the JSON layout"),
            MigrationBlocker::EmptyStore => f.write_str("store has no jobs table to migrate"),
            MigrationBlocker::MissingKeyColumn => f.write_str("legacy jobs table has no job_id column"),
            MigrationBlocker::MissingColumns { columns } => write!(
                f,
                "legacy jobs table lacks expected columns: {}",
                columns.join(", ")
            ),
            MigrationBlocker::NoVerifiedBackup => f.write_str("no verified backup exists"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupReport {
    pub success: bool,
    pub backup_path: Option<PathBuf>,
    pub table_counts: BTreeMap<String, i64>,
    pub page_count: i64,
    pub error: Option<String>,
}

impl BackupReport {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyReport {
    pub safe: bool,
    pub state: MigrationState,
    pub layout: SchemaType,
    pub blockers: Vec<MigrationBlocker>,
    pub warnings: Vec<String>,
    /// Expected legacy columns absent from the `jobs` table.
    pub missing_columns: Vec<String>,
    pub legacy_rows: i64,
    pub required_bytes: u64,
    pub available_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub success: bool,
    pub jobs_migrated: usize,
    pub sessions_migrated: usize,
    pub mappings_migrated: usize,
    pub blockers: Vec<MigrationBlocker>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub backup_path: Option<PathBuf>,
}

impl MigrationReport {
    /// Turn a blocked or failed run into an error.
    pub fn into_result(self) -> StoreResult<Self> {
        if self.success {
            Ok(self)
        } else if !self.blockers.is_empty() {
            Err(StoreError::MigrationBlocked(self.blockers))
        } else {
            Err(StoreError::MigrationFailed(
                self.error.unwrap_or_else(|| "unknown failure".to_string()),
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub success: bool,
    pub previous_state: MigrationState,
    pub restored_from: Option<PathBuf>,
    pub jobs_restored: i64,
    /// Why the rollback was refused.
    pub reason: Option<String>,
}

impl RollbackReport {
    fn refused(previous_state: MigrationState, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            previous_state,
            restored_from: None,
            jobs_restored: 0,
            reason: Some(reason.into()),
        }
    }
}

/// What a backup copy is checked on.
#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    integrity: String,
    table_counts: BTreeMap<String, i64>,
    page_count: i64,
}

impl Snapshot {
    fn of(conn: &Connection) -> StoreResult<Self> {
        Ok(Self {
            integrity: conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?,
            table_counts: table_counts(conn)?,
            page_count: page_count(conn)?,
        })
    }
}

/// Why `copy` cannot stand in for `source`, if it cannot.
fn backup_mismatch(source: &Snapshot, copy: &Snapshot) -> Option<String> {
    if copy.integrity != "ok" {
        Some(format!("backup failed integrity check: {}", copy.integrity))
    } else if copy.table_counts != source.table_counts {
        Some("backup row counts differ from the live database".to_string())
    } else if copy.page_count != source.page_count {
        Some(format!(
            "backup has {} pages, live database has {}",
            copy.page_count, source.page_count
        ))
    } else {
        None
    }
}

#[derive(Debug, Default)]
struct Converted {
    jobs: usize,
    sessions: usize,
    mappings: usize,
}

impl Database {
    pub fn migration_state(&self) -> StoreResult<MigrationState> {
        let raw = meta_get(&self.conn, MetaKey::MigrationState)?;
        Ok(MigrationState::from_meta(raw.as_deref()))
    }

    /// Path of the last verified backup, if the file is still there.
    pub fn verified_backup(&self) -> StoreResult<Option<PathBuf>> {
        Ok(meta_get(&self.conn, MetaKey::BackupPath)?
            .map(PathBuf::from)
            .filter(|path| path.exists()))
    }

    /// Copy the live database to a timestamped file with the online backup
    /// API, then check the copy table by table.
    ///
    /// Refused once a migration has committed: the pre-migration copy stays
    /// the rollback source.
    pub fn create_migration_backup(&mut self) -> StoreResult<BackupReport> {
        if self.is_in_memory() {
            return Ok(BackupReport::failed("in-memory stores cannot be backed up"));
        }
        if self.migration_state()? == MigrationState::Committed {
            return Ok(BackupReport::failed(
                "migration already committed; the pre-migration backup is kept",
            ));
        }
        let path = self.backup_path_for(Utc::now());
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        self.conn.backup(DatabaseName::Main, &path, None)?;
        self.adopt_backup(path)
    }

    /// Keep `path` as the rollback source if it matches the live store.
    ///
    /// A copy that does not match is deleted, any earlier backup is forgotten
    /// and the state drops back to not started.
    fn adopt_backup(&mut self, path: PathBuf) -> StoreResult<BackupReport> {
        let source = Snapshot::of(&self.conn)?;
        let copy = Snapshot::of(&Connection::open(&path)?)?;

        if let Some(reason) = backup_mismatch(&source, &copy) {
            warn!(path = %path.display(), %reason, "discarding unverified backup");
            std::fs::remove_file(&path)?;
            meta_clear(&self.conn, MetaKey::BackupPath)?;
            if matches!(
                self.migration_state()?,
                MigrationState::BackedUp | MigrationState::Validated
            ) {
                meta_set(
                    &self.conn,
                    MetaKey::MigrationState,
                    MigrationState::NotStarted.as_str(),
                )?;
            }
            return Ok(BackupReport::failed(reason));
        }

        meta_set(&self.conn, MetaKey::BackupPath, &path.to_string_lossy())?;
        if matches!(
            self.migration_state()?,
            MigrationState::NotStarted | MigrationState::BackedUp | MigrationState::Validated
        ) {
            meta_set(
                &self.conn,
                MetaKey::MigrationState,
                MigrationState::BackedUp.as_str(),
            )?;
        }

        info!(path = %path.display(), pages = source.page_count, "backup created and verified");
        Ok(BackupReport {
            success: true,
            backup_path: Some(path),
            table_counts: source.table_counts,
            page_count: source.page_count,
            error: None,
        })
    }

    /// Pre-flight checks. Reads structure and counts only.
    pub fn validate_migration_safety(&mut self) -> StoreResult<SafetyReport> {
        let state = self.migration_state()?;
        let layout = schema::detect_schema_type(&self.conn)?;
        let mut blockers = vec![];
        let mut warnings = vec![];
        let mut missing_columns = vec![];
        let mut legacy_rows = 0;

        if state == MigrationState::Migrating {
            blockers.push(MigrationBlocker::MigrationInProgress);
        }
        match layout {
            SchemaType::JsonPrimary => blockers.push(MigrationBlocker::AlreadyJsonPrimary),
            SchemaType::Empty => blockers.push(MigrationBlocker::EmptyStore),
            SchemaType::Columnar => {
                let columns = schema::table_columns(&self.conn, "jobs")?;
                if !columns.iter().any(|c| c == "job_id") {
                    blockers.push(MigrationBlocker::MissingKeyColumn);
                }
                for wanted in LEGACY_COLUMNS.iter().skip(1) {
                    if !columns.iter().any(|c| c == wanted) {
                        missing_columns.push(wanted.to_string());
                    }
                }
                if !missing_columns.is_empty() {
                    blockers.push(MigrationBlocker::MissingColumns {
                        columns: missing_columns.clone(),
                    });
                }
                legacy_rows =
                    self.conn
                        .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
            }
        }

        if self.verified_backup()?.is_none() {
            blockers.push(MigrationBlocker::NoVerifiedBackup);
        }

        let required_bytes = self.store_bytes();
        let available_bytes = if self.is_in_memory() {
            None
        } else {
            match fs2::available_space(self.store_dir()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warnings.push(format!("could not read free disk space: {}", e));
                    None
                }
            }
        };
        if let Some(blocker) =
            available_bytes.and_then(|available| disk_blocker(required_bytes, available))
        {
            blockers.push(blocker);
        }

        let safe = blockers.is_empty();
        if safe && state == MigrationState::BackedUp {
            meta_set(
                &self.conn,
                MetaKey::MigrationState,
                MigrationState::Validated.as_str(),
            )?;
        }

        Ok(SafetyReport {
            safe,
            state: self.migration_state()?,
            layout,
            blockers,
            warnings,
            missing_columns,
            legacy_rows,
            required_bytes,
            available_bytes,
        })
    }

    /// Convert a legacy store in place.
    ///
    /// Blockers and conversion failures come back in the report; the error
    /// path is reserved for failures outside the conversion transaction.
    pub fn migrate_to_json_schema(&mut self) -> StoreResult<MigrationReport> {
        let mut report = MigrationReport::default();

        let state = self.migration_state()?;
        let layout = schema::detect_schema_type(&self.conn)?;
        // Always a fresh copy: legacy rows may have changed since an earlier one.
        if layout == SchemaType::Columnar && state != MigrationState::Migrating {
            let backup = self.create_migration_backup()?;
            if let Some(reason) = backup.error {
                report.warnings.push(format!("backup failed: {}", reason));
            }
        }

        let safety = self.validate_migration_safety()?;
        report.warnings.extend(safety.warnings);
        report.backup_path = self.verified_backup()?;
        if !safety.safe {
            warn!(blockers = ?safety.blockers, "migration blocked");
            report.blockers = safety.blockers;
            return Ok(report);
        }

        meta_set(
            &self.conn,
            MetaKey::MigrationState,
            MigrationState::Migrating.as_str(),
        )?;
        info!(rows = safety.legacy_rows, "migrating legacy store to JSON layout");

        self.conn.execute_batch("PRAGMA foreign_keys=OFF;")?;
        let result = self.convert_legacy(&mut report.warnings);
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.layout = schema::detect_schema_type(&self.conn)?;

        match result {
            Ok(converted) => {
                report.success = true;
                report.jobs_migrated = converted.jobs;
                report.sessions_migrated = converted.sessions;
                report.mappings_migrated = converted.mappings;
                info!(
                    jobs = converted.jobs,
                    sessions = converted.sessions,
                    mappings = converted.mappings,
                    warnings = report.warnings.len(),
                    "migration committed"
                );
            }
            Err(e) => {
                error!(error = %e, "migration failed; legacy rows left untouched");
                meta_set(&self.conn, MetaKey::LastMigrationError, &e.to_string())?;
                report.error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    fn convert_legacy(&mut self, warnings: &mut Vec<String>) -> StoreResult<Converted> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let migrated_at = now();

        for (kind, name) in legacy_objects(&tx)? {
            tx.execute_batch(&format!("DROP {} IF EXISTS \"{}\";", kind, name))?;
        }
        tx.execute_batch("DROP TABLE IF EXISTS jobs_fts;")?;
        for table in LEGACY_TABLES {
            if schema::table_exists(&tx, table)? {
                tx.execute_batch(&format!("ALTER TABLE {0} RENAME TO {0}_legacy;", table))?;
            }
        }
        schema::create_json_schema(&tx)?;

        let mut converted = Converted::default();

        // jobs
        let expected_jobs: i64 =
            tx.query_row("SELECT COUNT(*) FROM jobs_legacy", [], |row| row.get(0))?;
        let legacy = {
            let sql = format!(
                "SELECT {} FROM jobs_legacy ORDER BY rowid",
                legacy_select(&schema::table_columns(&tx, "jobs_legacy")?)
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map([], LegacyJob::from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for row in legacy {
            if let Some(job) = row.into_stored(migrated_at, warnings) {
                write_job(&tx, &job)?;
                converted.jobs += 1;
            }
        }
        let actual_jobs: i64 = tx.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        if actual_jobs != expected_jobs {
            return Err(StoreError::MigrationFailed(format!(
                "{} legacy jobs but {} migrated",
                expected_jobs, actual_jobs
            )));
        }

        // sessions
        if schema::table_exists(&tx, "scrape_sessions_legacy")? {
            let expected: i64 = tx.query_row(
                "SELECT COUNT(*) FROM scrape_sessions_legacy",
                [],
                |row| row.get(0),
            )?;
            converted.sessions = convert_sessions(&tx, migrated_at, warnings)?;
            if converted.sessions as i64 != expected {
                return Err(StoreError::MigrationFailed(format!(
                    "{} legacy sessions but {} migrated",
                    expected, converted.sessions
                )));
            }
        }

        // session mappings
        if schema::table_exists(&tx, "job_session_mapping_legacy")? {
            let columns = schema::table_columns(&tx, "job_session_mapping_legacy")?;
            if columns.iter().any(|c| c == "job_id") && columns.iter().any(|c| c == "session_id") {
                let position = if columns.iter().any(|c| c == "position_in_results") {
                    "COALESCE(position_in_results, 0)"
                } else {
                    "0"
                };
                let total: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM job_session_mapping_legacy",
                    [],
                    |row| row.get(0),
                )?;
                converted.mappings = tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO job_session_mapping (job_id, session_id, position_in_results)
                         SELECT job_id, session_id, {} FROM job_session_mapping_legacy
                         WHERE job_id IS NOT NULL
                           AND session_id IN (SELECT session_id FROM scrape_sessions)
                         ORDER BY rowid",
                        position
                    ),
                    [],
                )?;
                let dropped = total - converted.mappings as i64;
                if dropped > 0 {
                    warnings.push(format!(
                        "{} session mappings were duplicates or pointed at unknown sessions",
                        dropped
                    ));
                }
            } else {
                warnings.push("legacy job_session_mapping lacks key columns; not migrated".into());
            }
        }

        search_index::rebuild_all(&tx)?;
        for table in LEGACY_TABLES.iter().rev() {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}_legacy;", table))?;
        }

        meta_set(&tx, MetaKey::MigrationState, MigrationState::Committed.as_str())?;
        meta_set(&tx, MetaKey::RollbackWindow, "open")?;
        meta_set(&tx, MetaKey::MigratedAt, &format_ts(migrated_at))?;
        meta_clear(&tx, MetaKey::LastMigrationError)?;
        tx.commit()?;
        Ok(converted)
    }

    /// Restore the pre-migration backup.
    ///
    /// Allowed while a migration is recorded as running, or after a commit
    /// as long as nothing has been written since.
    pub fn rollback_migration(&mut self) -> StoreResult<RollbackReport> {
        let state = self.migration_state()?;
        let window_open =
            meta_get(&self.conn, MetaKey::RollbackWindow)?.as_deref() == Some("open");
        let allowed = match state {
            MigrationState::Migrating => true,
            MigrationState::Committed => window_open,
            _ => false,
        };
        if !allowed {
            let reason = if state == MigrationState::Committed {
                "the store has been written since the migration committed".to_string()
            } else {
                format!("no migration to roll back (state: {})", state)
            };
            return Ok(RollbackReport::refused(state, reason));
        }

        let Some(backup) = self.verified_backup()? else {
            return Ok(RollbackReport::refused(state, "backup file is missing"));
        };

        self.conn
            .restore(DatabaseName::Main, &backup, None::<fn(Progress)>)?;

        schema::ensure_meta(&self.conn)?;
        meta_set(
            &self.conn,
            MetaKey::MigrationState,
            MigrationState::NotStarted.as_str(),
        )?;
        meta_set(&self.conn, MetaKey::BackupPath, &backup.to_string_lossy())?;
        meta_clear(&self.conn, MetaKey::RollbackWindow)?;
        self.layout = schema::detect_schema_type(&self.conn)?;
        let jobs_restored = self.count_jobs()?;

        info!(
            path = %backup.display(),
            previous = %state,
            jobs = jobs_restored,
            "migration rolled back"
        );
        Ok(RollbackReport {
            success: true,
            previous_state: state,
            restored_from: Some(backup),
            jobs_restored,
            reason: None,
        })
    }

    fn backup_path_for(&self, at: DateTime<Utc>) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "jobstash.db".to_string());
        let name = format!("{}.backup-{}", file_name, at.format("%Y%m%dT%H%M%S%6fZ"));
        match &self.backup_dir {
            Some(dir) => dir.join(name),
            None => self.store_dir().join(name),
        }
    }

    fn store_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Database file plus WAL; what a second copy of the data needs.
    fn store_bytes(&self) -> u64 {
        if self.is_in_memory() {
            return 0;
        }
        let mut wal = self.path.clone().into_os_string();
        wal.push("-wal");
        [self.path.as_path(), Path::new(&wal)]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

fn disk_blocker(required_bytes: u64, available_bytes: u64) -> Option<MigrationBlocker> {
    (available_bytes < required_bytes).then_some(MigrationBlocker::InsufficientDiskSpace {
        required_bytes,
        available_bytes,
    })
}

fn table_counts(conn: &Connection) -> StoreResult<BTreeMap<String, i64>> {
    let names: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
               AND sql NOT LIKE 'CREATE VIRTUAL TABLE%'
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    let mut counts = BTreeMap::new();
    for name in names {
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", name), [], |row| {
                row.get(0)
            })?;
        counts.insert(name, count);
    }
    Ok(counts)
}

fn page_count(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.query_row("PRAGMA page_count", [], |row| row.get(0))?)
}

/// Explicit indexes and triggers hanging off the legacy tables.
fn legacy_objects(conn: &Connection) -> StoreResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT UPPER(type), name FROM sqlite_master
         WHERE type IN ('index', 'trigger') AND sql IS NOT NULL
           AND tbl_name IN ('jobs', 'scrape_sessions', 'job_session_mapping')",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn legacy_select(columns: &[String]) -> String {
    LEGACY_COLUMNS
        .iter()
        .map(|wanted| {
            if columns.iter().any(|c| c == wanted) {
                format!("\"{}\"", wanted)
            } else {
                "NULL".to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Any SQLite value as text; legacy tables are loosely typed.
fn text(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    })
}

fn convert_sessions(
    conn: &Connection,
    migrated_at: DateTime<Utc>,
    warnings: &mut Vec<String>,
) -> StoreResult<usize> {
    let columns = schema::table_columns(conn, "scrape_sessions_legacy")?;
    let pick = |names: &[&str], fallback: &str| -> String {
        names
            .iter()
            .find(|name| columns.iter().any(|c| c.as_str() == **name))
            .map(|name| format!("\"{}\"", name))
            .unwrap_or_else(|| fallback.to_string())
    };
    // Older rows carry a single `timestamp` written when the run finished.
    let ended = if columns.iter().any(|c| c == "started_at") {
        pick(&["ended_at"], "NULL")
    } else {
        pick(&["timestamp"], "NULL")
    };
    let sql = format!(
        "SELECT rowid, {}, {}, CAST(COALESCE({}, 0) AS INTEGER), CAST(COALESCE({}, 0) AS INTEGER),
                CAST(COALESCE({}, 0) AS INTEGER), CAST(COALESCE({}, 0) AS INTEGER), {}, {}, {}
         FROM scrape_sessions_legacy ORDER BY rowid",
        pick(&["started_at", "timestamp"], "NULL"),
        ended,
        pick(&["jobs_seen", "total_jobs_found"], "0"),
        pick(&["jobs_new", "new_jobs_added"], "0"),
        pick(&["jobs_updated"], "0"),
        pick(&["jobs_removed"], "0"),
        pick(&["source"], "NULL"),
        pick(&["search_criteria"], "NULL"),
        pick(&["notes"], "NULL"),
    );

    let rows = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                text(row, 1)?,
                text(row, 2)?,
                [row.get::<_, i64>(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
                [text(row, 7)?, text(row, 8)?, text(row, 9)?],
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut migrated = 0;
    for (session_id, started, ended, counters, [source, criteria, notes]) in rows {
        let started_at = match started.as_deref().and_then(parse_ts) {
            Some(ts) => ts,
            None => {
                warnings.push(format!(
                    "session {}: unreadable start time; using migration time",
                    session_id
                ));
                migrated_at
            }
        };
        let ended_at = ended
            .as_deref()
            .and_then(parse_ts)
            .map(|ts| ts.max(started_at));
        let [seen, new, updated, removed] = counters;
        conn.execute(
            "INSERT INTO scrape_sessions (session_id, started_at, ended_at, jobs_seen, jobs_new,
                 jobs_updated, jobs_removed, source, search_criteria, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                session_id,
                format_ts(started_at),
                ended_at.map(format_ts),
                seen,
                new,
                updated,
                removed,
                source,
                criteria,
                notes
            ],
        )?;
        migrated += 1;
    }
    Ok(migrated)
}

/// Read one job from a columnar store without converting the store.
pub(crate) fn read_legacy_job(conn: &Connection, job_id: &str) -> StoreResult<Option<StoredJob>> {
    let columns = schema::table_columns(conn, "jobs")?;
    if !columns.iter().any(|c| c == "job_id") {
        return Ok(None);
    }
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM jobs WHERE job_id = ?1 LIMIT 1",
                legacy_select(&columns)
            ),
            [job_id],
            LegacyJob::from_row,
        )
        .optional()?;
    let mut ignored = vec![];
    Ok(row.and_then(|row| row.into_stored(now(), &mut ignored)))
}

/// One row of the legacy `jobs` table, columns in `LEGACY_COLUMNS` order.
struct LegacyJob {
    job_id: Option<String>,
    title: Option<String>,
    company: Option<String>,
    work_type: Option<String>,
    location: Option<String>,
    salary: Option<String>,
    benefits: Option<String>,
    url: Option<String>,
    description: Option<String>,
    status: Option<String>,
    source: Option<String>,
    first_seen: Option<String>,
    last_seen: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

impl LegacyJob {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        // 11 and 12 are the legacy salary columns, recomputed from `salary`
        Ok(Self {
            job_id: text(row, 0)?,
            title: text(row, 1)?,
            company: text(row, 2)?,
            work_type: text(row, 3)?,
            location: text(row, 4)?,
            salary: text(row, 5)?,
            benefits: text(row, 6)?,
            url: text(row, 7)?,
            description: text(row, 8)?,
            status: text(row, 9)?,
            source: text(row, 10)?,
            first_seen: text(row, 13)?,
            last_seen: text(row, 14)?,
            created_at: text(row, 15)?,
            updated_at: text(row, 16)?,
        })
    }

    fn into_stored(
        self,
        migrated_at: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) -> Option<StoredJob> {
        let Some(job_id) = self.job_id.filter(|id| !id.trim().is_empty()) else {
            warnings.push("legacy row without job_id skipped".to_string());
            return None;
        };

        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => JobStatus::Active,
            Some(raw) => raw.parse::<JobStatus>().unwrap_or_else(|_| {
                warnings.push(format!("{}: unknown status '{}' stored as active", job_id, raw));
                JobStatus::Active
            }),
        };

        let mut timestamp = |label: &str, raw: Option<String>| match raw {
            None => migrated_at,
            Some(raw) => parse_ts(&raw).unwrap_or_else(|| {
                warnings.push(format!(
                    "{}: unreadable {} '{}'; using migration time",
                    job_id, label, raw
                ));
                migrated_at
            }),
        };
        let first_seen = timestamp("first_seen", self.first_seen);
        let last_seen = timestamp("last_seen", self.last_seen).max(first_seen);
        let created_at = timestamp("created_at", self.created_at);
        let updated_at = timestamp("updated_at", self.updated_at).max(created_at);

        let record = JobRecord {
            job_id,
            title: self.title,
            company: self.company,
            work_type: self.work_type,
            location: self.location,
            salary: self.salary,
            benefits: self.benefits,
            url: self.url,
            description: self.description,
            status: Some(status),
            source: self.source,
        };
        let (salary_min_yearly, salary_max_yearly) = record.salary_range();
        Some(StoredJob {
            record,
            salary_min_yearly,
            salary_max_yearly,
            first_seen,
            last_seen,
            created_at,
            updated_at,
        })
    }
}
