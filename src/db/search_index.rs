//! Keeps `jobs_fts` in step with `jobs`.
//!
//! An entry shares its rowid with the `jobs` row it was built from and
//! records that row's `job_id` and `updated_at`, so a stale, missing or
//! orphaned entry is found with rowid lookups instead of a rebuild.

use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::schema::SchemaType;
use super::Database;
use crate::error::StoreResult;

fn job_rowid(conn: &Connection, job_id: &str) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row("SELECT rowid FROM jobs WHERE job_id = ?1", [job_id], |row| {
            row.get(0)
        })
        .optional()?)
}

/// Replace the entry at `rowid` with one built from the current row, or drop
/// it when the row is gone.
fn reindex_row(conn: &Connection, rowid: i64) -> StoreResult<()> {
    conn.execute("DELETE FROM jobs_fts WHERE rowid = ?1", [rowid])?;
    conn.execute(
        "INSERT INTO jobs_fts (rowid, job_id, title, company, description, synced_at)
         SELECT rowid, job_id, title, company, description, updated_at FROM jobs WHERE rowid = ?1",
        [rowid],
    )?;
    Ok(())
}

/// Replace the entry for one job with one built from its current document.
pub(crate) fn reindex_job(conn: &Connection, job_id: &str) -> StoreResult<()> {
    if let Some(rowid) = job_rowid(conn, job_id)? {
        reindex_row(conn, rowid)?;
    }
    Ok(())
}

/// Drop the entry of a job. Call before the `jobs` row is deleted.
pub(crate) fn remove_job(conn: &Connection, job_id: &str) -> StoreResult<()> {
    if let Some(rowid) = job_rowid(conn, job_id)? {
        conn.execute("DELETE FROM jobs_fts WHERE rowid = ?1", [rowid])?;
    }
    Ok(())
}

pub(crate) fn rebuild_all(conn: &Connection) -> StoreResult<usize> {
    conn.execute("DELETE FROM jobs_fts", [])?;
    let rows = conn.execute(
        "INSERT INTO jobs_fts (rowid, job_id, title, company, description, synced_at)
         SELECT rowid, job_id, title, company, description, updated_at FROM jobs",
        [],
    )?;
    Ok(rows)
}

/// Rowids whose index entry is missing, stale or orphaned.
///
/// Both passes walk one table and look up the other by rowid.
pub(crate) fn out_of_sync(conn: &Connection) -> StoreResult<BTreeSet<i64>> {
    let mut rowids = BTreeSet::new();
    for sql in [
        "SELECT j.rowid FROM jobs j
         LEFT JOIN jobs_fts f ON f.rowid = j.rowid
         WHERE f.rowid IS NULL
            OR f.job_id IS NOT j.job_id
            OR f.synced_at IS NOT j.updated_at",
        "SELECT f.rowid FROM jobs_fts f
         LEFT JOIN jobs j ON j.rowid = f.rowid
         WHERE j.rowid IS NULL",
    ] {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        for rowid in rows {
            rowids.insert(rowid?);
        }
    }
    Ok(rowids)
}

impl Database {
    /// Repair index entries that drifted from their documents.
    ///
    /// Runs on every open of a JSON-primary store. Returns how many entries
    /// were rebuilt or dropped.
    pub fn reconcile_search_index(&mut self) -> StoreResult<usize> {
        if self.layout != SchemaType::JsonPrimary {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let stale = out_of_sync(&tx)?;
        for rowid in &stale {
            reindex_row(&tx, *rowid)?;
        }
        tx.commit()?;

        if !stale.is_empty() {
            warn!(
                count = stale.len(),
                "search index out of sync with stored documents; entries rebuilt"
            );
        }
        Ok(stale.len())
    }

    /// Drop and rebuild the whole full-text index.
    pub fn rebuild_search_index(&mut self) -> StoreResult<usize> {
        self.require_layout(SchemaType::JsonPrimary)?;
        let tx = self.conn.transaction()?;
        let rows = rebuild_all(&tx)?;
        tx.commit()?;
        info!(rows, "search index rebuilt");
        Ok(rows)
    }
}
