use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use tracing::info;

use super::jobs::{Sighting, retire_missing};
use super::schema::SchemaType;
use super::{Database, format_ts, now, parse_ts};
use crate::error::{StoreError, StoreResult};
use crate::models::{JobSessionMapping, NewSession, ScrapeSession, UpsertOutcome};

const SESSION_COLUMNS: &str = "session_id, started_at, ended_at, jobs_seen, jobs_new, \
     jobs_updated, jobs_removed, source, search_criteria, notes";

impl Database {
    pub fn start_session(&mut self, new: &NewSession) -> StoreResult<i64> {
        let tx = self.begin_write()?;
        tx.execute(
            "INSERT INTO scrape_sessions (started_at, source, search_criteria, notes)
             VALUES (?1, ?2, ?3, ?4)",
            params![format_ts(now()), new.source, new.search_criteria, new.notes],
        )?;
        let session_id = tx.last_insert_rowid();
        tx.commit()?;
        info!(session_id, "scrape session started");
        Ok(session_id)
    }

    /// Close a session and freeze its counters.
    ///
    /// With `mark_missing_removed`, every active job the session did not see
    /// becomes `removed` and is counted in `jobs_removed`. Closing an already
    /// closed session returns it unchanged.
    pub fn close_session(
        &mut self,
        session_id: i64,
        mark_missing_removed: bool,
    ) -> StoreResult<ScrapeSession> {
        let tx = self.begin_write()?;
        let session = load_session(&tx, session_id)?.ok_or_else(|| unknown(session_id))?;
        if session.is_closed() {
            return Ok(session);
        }

        let removed = if mark_missing_removed {
            let seen: HashSet<String> = {
                let mut stmt =
                    tx.prepare("SELECT job_id FROM job_session_mapping WHERE session_id = ?1")?;
                let rows = stmt.query_map([session_id], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<_, _>>()?
            };
            retire_missing(&tx, &seen)?
        } else {
            0
        };

        tx.execute(
            "UPDATE scrape_sessions SET ended_at = ?1, jobs_removed = ?2 WHERE session_id = ?3",
            params![format_ts(now()), removed as i64, session_id],
        )?;
        let closed = load_session(&tx, session_id)?.ok_or_else(|| unknown(session_id))?;
        tx.commit()?;

        info!(
            session_id,
            seen = closed.jobs_seen,
            new = closed.jobs_new,
            updated = closed.jobs_updated,
            removed = closed.jobs_removed,
            "scrape session closed"
        );
        Ok(closed)
    }

    pub fn get_session(&self, session_id: i64) -> StoreResult<Option<ScrapeSession>> {
        self.require_layout(SchemaType::JsonPrimary)?;
        load_session(&self.conn, session_id)
    }

    /// Most recent sessions first.
    pub fn list_sessions(&self, limit: usize) -> StoreResult<Vec<ScrapeSession>> {
        self.require_layout(SchemaType::JsonPrimary)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM scrape_sessions ORDER BY session_id DESC LIMIT ?1",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map([limit as i64], SessionRow::from_row)?;
        rows.map(|row| row?.into_session()).collect()
    }

    /// Every session that saw `job_id`, oldest first.
    pub fn job_sessions(&self, job_id: &str) -> StoreResult<Vec<JobSessionMapping>> {
        self.mappings("WHERE job_id = ?1 ORDER BY session_id", job_id)
    }

    /// Every job a session saw, in result order.
    pub fn session_jobs(&self, session_id: i64) -> StoreResult<Vec<JobSessionMapping>> {
        self.mappings("WHERE session_id = ?1 ORDER BY position_in_results, job_id", session_id)
    }

    fn mappings<P: rusqlite::ToSql>(&self, clause: &str, key: P) -> StoreResult<Vec<JobSessionMapping>> {
        self.require_layout(SchemaType::JsonPrimary)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT job_id, session_id, position_in_results FROM job_session_mapping {}",
            clause
        ))?;
        let rows = stmt.query_map([key], |row| {
            Ok(JobSessionMapping {
                job_id: row.get(0)?,
                session_id: row.get(1)?,
                position: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete a session and, by cascade, its job mappings.
    pub fn purge_session(&mut self, session_id: i64) -> StoreResult<bool> {
        let tx = self.begin_write()?;
        tx.execute(
            "DELETE FROM job_session_mapping WHERE session_id = ?1",
            [session_id],
        )?;
        let deleted = tx.execute(
            "DELETE FROM scrape_sessions WHERE session_id = ?1",
            [session_id],
        )?;
        tx.commit()?;
        Ok(deleted > 0)
    }
}

fn unknown(session_id: i64) -> StoreError {
    StoreError::Validation(format!("unknown scrape session {}", session_id))
}

pub(crate) fn require_open_session(conn: &Connection, session_id: i64) -> StoreResult<()> {
    let ended: Option<Option<String>> = conn
        .query_row(
            "SELECT ended_at FROM scrape_sessions WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )
        .optional()?;
    match ended {
        None => Err(unknown(session_id)),
        Some(Some(_)) => Err(StoreError::Validation(format!(
            "scrape session {} is closed",
            session_id
        ))),
        Some(None) => Ok(()),
    }
}

/// Map a job to a session and bump the session counters.
///
/// A repeated sighting of the same pair is ignored, counters included.
pub(crate) fn record_sighting(
    conn: &Connection,
    job_id: &str,
    sighting: Sighting,
    outcome: UpsertOutcome,
) -> StoreResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO job_session_mapping (job_id, session_id, position_in_results)
         VALUES (?1, ?2, ?3)",
        params![job_id, sighting.session_id, sighting.position],
    )?;
    if inserted == 0 {
        return Ok(false);
    }
    conn.execute(
        "UPDATE scrape_sessions
         SET jobs_seen = jobs_seen + 1,
             jobs_new = jobs_new + ?2,
             jobs_updated = jobs_updated + ?3
         WHERE session_id = ?1",
        params![
            sighting.session_id,
            outcome.created as i64,
            (outcome.changed && !outcome.created) as i64
        ],
    )?;
    Ok(true)
}

fn load_session(conn: &Connection, session_id: i64) -> StoreResult<Option<ScrapeSession>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM scrape_sessions WHERE session_id = ?1",
                SESSION_COLUMNS
            ),
            [session_id],
            SessionRow::from_row,
        )
        .optional()?;
    row.map(SessionRow::into_session).transpose()
}

struct SessionRow {
    session_id: i64,
    started_at: String,
    ended_at: Option<String>,
    counters: [i64; 4],
    source: Option<String>,
    search_criteria: Option<String>,
    notes: Option<String>,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            started_at: row.get(1)?,
            ended_at: row.get(2)?,
            counters: [row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
            source: row.get(7)?,
            search_criteria: row.get(8)?,
            notes: row.get(9)?,
        })
    }

    fn into_session(self) -> StoreResult<ScrapeSession> {
        let ts = |raw: &str| {
            parse_ts(raw).ok_or_else(|| {
                StoreError::Validation(format!("unreadable session timestamp '{}'", raw))
            })
        };
        let [jobs_seen, jobs_new, jobs_updated, jobs_removed] = self.counters;
        Ok(ScrapeSession {
            session_id: self.session_id,
            started_at: ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(ts).transpose()?,
            jobs_seen,
            jobs_new,
            jobs_updated,
            jobs_removed,
            source: self.source,
            search_criteria: self.search_criteria,
            notes: self.notes,
        })
    }
}
