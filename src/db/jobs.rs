use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::{debug, info};

use super::{Database, load_job, now, now_after, search_index, sessions, write_job};
use crate::error::{StoreError, StoreResult};
use crate::models::{IngestReport, JobRecord, JobStatus, StoredJob, UpsertOutcome};

/// Where a job was seen: which scrape session, at which 1-based rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sighting {
    pub session_id: i64,
    pub position: i64,
}

impl Database {
    /// Insert or update one job keyed by `job_id`.
    ///
    /// With `preserve_existing`, fields missing from `record` keep their stored
    /// values; otherwise `record` replaces the stored fields one by one.
    /// `last_seen` always moves; `updated_at` and the search index only move
    /// when the merged document differs from the stored one.
    pub fn upsert(
        &mut self,
        record: &JobRecord,
        preserve_existing: bool,
        sighting: Option<Sighting>,
    ) -> StoreResult<UpsertOutcome> {
        record.validate()?;
        let tx = self.begin_write()?;
        if let Some(s) = sighting {
            sessions::require_open_session(&tx, s.session_id)?;
        }

        let outcome = match load_job(&tx, &record.job_id)? {
            None => {
                let ts = now();
                let mut fresh = record.clone();
                fresh.status.get_or_insert(JobStatus::Active);
                write_job(&tx, &stored(fresh, ts))?;
                UpsertOutcome {
                    created: true,
                    changed: true,
                }
            }
            Some(mut existing) => {
                let merged = merge(record, &existing.record, preserve_existing);
                let changed = merged.to_document() != existing.record.to_document();
                let ts = now_after(existing.last_seen.max(existing.updated_at));
                existing.last_seen = ts;
                if changed {
                    existing.record = merged;
                    existing.updated_at = ts;
                }
                write_job(&tx, &existing)?;
                UpsertOutcome {
                    created: false,
                    changed,
                }
            }
        };

        if outcome.changed {
            search_index::reindex_job(&tx, &record.job_id)?;
        }
        if let Some(s) = sighting {
            sessions::record_sighting(&tx, &record.job_id, s, outcome)?;
        }
        tx.commit()?;

        debug!(
            job_id = %record.job_id,
            created = outcome.created,
            changed = outcome.changed,
            "job upserted"
        );
        Ok(outcome)
    }

    /// Plain full-replace upsert outside of any session.
    pub fn upsert_job(&mut self, record: &JobRecord) -> StoreResult<UpsertOutcome> {
        self.upsert(record, false, None)
    }

    /// Upsert a scrape session's results in discovery order.
    ///
    /// Records failing validation are reported and skipped; any other error
    /// stops the run. Positions are 1-based.
    pub fn ingest<I>(
        &mut self,
        session_id: i64,
        records: I,
        preserve_existing: bool,
    ) -> StoreResult<IngestReport>
    where
        I: IntoIterator<Item = JobRecord>,
    {
        self.ingest_decoded(session_id, records.into_iter().map(Ok), preserve_existing)
    }

    /// [`Database::ingest`] over raw JSON documents. A document that does not
    /// decode is rejected at its position with the decoding error.
    pub fn ingest_documents<I>(
        &mut self,
        session_id: i64,
        documents: I,
        preserve_existing: bool,
    ) -> StoreResult<IngestReport>
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        let records = documents
            .into_iter()
            .map(|doc| JobRecord::from_document(&doc));
        self.ingest_decoded(session_id, records, preserve_existing)
    }

    fn ingest_decoded(
        &mut self,
        session_id: i64,
        records: impl Iterator<Item = StoreResult<JobRecord>>,
        preserve_existing: bool,
    ) -> StoreResult<IngestReport> {
        let mut report = IngestReport {
            session_id,
            ..Default::default()
        };

        for (idx, record) in records.enumerate() {
            let position = idx as i64 + 1;
            report.processed += 1;
            let sighting = Sighting {
                session_id,
                position,
            };
            let upserted =
                record.and_then(|record| self.upsert(&record, preserve_existing, Some(sighting)));
            match upserted {
                Ok(UpsertOutcome { created: true, .. }) => report.created += 1,
                Ok(UpsertOutcome { changed: true, .. }) => report.updated += 1,
                Ok(_) => report.unchanged += 1,
                Err(StoreError::Validation(reason)) => report.rejected.push((position, reason)),
                Err(e) => return Err(e),
            }
        }

        info!(
            session_id,
            processed = report.processed,
            created = report.created,
            updated = report.updated,
            rejected = report.rejected.len(),
            "ingest finished"
        );
        Ok(report)
    }

    /// Mark every active job whose id is not in `active_job_ids` as removed.
    ///
    /// An empty slice retires all active jobs. Rows and history are kept.
    pub fn mark_jobs_removed<S: AsRef<str>>(&mut self, active_job_ids: &[S]) -> StoreResult<usize> {
        let keep: HashSet<String> = active_job_ids
            .iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        let tx = self.begin_write()?;
        let removed = retire_missing(&tx, &keep)?;
        tx.commit()?;
        info!(removed, "jobs marked removed");
        Ok(removed)
    }

    /// Change the status of one stored job (e.g. after applying).
    pub fn set_job_status(&mut self, job_id: &str, status: JobStatus) -> StoreResult<bool> {
        let tx = self.begin_write()?;
        let Some(mut job) = load_job(&tx, job_id)? else {
            return Ok(false);
        };
        if job.record.status == Some(status) {
            return Ok(true);
        }
        job.record.status = Some(status);
        job.updated_at = now_after(job.updated_at.max(job.last_seen));
        write_job(&tx, &job)?;
        search_index::reindex_job(&tx, job_id)?;
        tx.commit()?;
        Ok(true)
    }

    /// Physically delete a job with its index entry and session mappings.
    ///
    /// Administrative only; the scrape lifecycle never deletes rows.
    pub fn purge_job(&mut self, job_id: &str) -> StoreResult<bool> {
        let tx = self.begin_write()?;
        tx.execute("DELETE FROM job_session_mapping WHERE job_id = ?1", [job_id])?;
        search_index::remove_job(&tx, job_id)?;
        let deleted = tx.execute("DELETE FROM jobs WHERE job_id = ?1", [job_id])?;
        tx.commit()?;
        if deleted > 0 {
            info!(job_id, "job purged");
        }
        Ok(deleted > 0)
    }
}

fn stored(record: JobRecord, ts: DateTime<Utc>) -> StoredJob {
    let (salary_min_yearly, salary_max_yearly) = record.salary_range();
    StoredJob {
        record,
        salary_min_yearly,
        salary_max_yearly,
        first_seen: ts,
        last_seen: ts,
        created_at: ts,
        updated_at: ts,
    }
}

fn merge(incoming: &JobRecord, existing: &JobRecord, preserve_existing: bool) -> JobRecord {
    let mut merged = if preserve_existing {
        incoming.clone().fill_from(existing)
    } else {
        let mut replaced = incoming.clone();
        if replaced.status.is_none() {
            replaced.status = existing.status;
        }
        replaced
    };

    // Being observed again brings a removed posting back, unless the caller
    // said otherwise.
    if incoming.status.is_none() {
        merged.status = match merged.status {
            None | Some(JobStatus::Removed) => Some(JobStatus::Active),
            other => other,
        };
    }
    merged
}

/// Set `removed` on active jobs not in `keep`. Runs inside the caller's
/// transaction.
pub(crate) fn retire_missing(conn: &Connection, keep: &HashSet<String>) -> StoreResult<usize> {
    let active: Vec<String> = {
        let mut stmt = conn.prepare("SELECT job_id FROM jobs WHERE status = 'active'")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut removed = 0;
    for job_id in active.iter().filter(|id| !keep.contains(*id)) {
        let Some(mut job) = load_job(conn, job_id)? else {
            continue;
        };
        job.record.status = Some(JobStatus::Removed);
        job.updated_at = now_after(job.updated_at.max(job.last_seen));
        write_job(conn, &job)?;
        search_index::reindex_job(conn, job_id)?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewSession;

    fn full(id: &str) -> JobRecord {
        JobRecord {
            title: Some("Senior Developer".into()),
            company: Some("TechCorp".into()),
            work_type: Some("Remote".into()),
            location: Some("San Francisco, CA".into()),
            salary: Some("$120K/yr - $150K/yr".into()),
            description: Some("Build scalable systems".into()),
            source: Some("linkedin".into()),
            ..JobRecord::new(id)
        }
    }

    #[test]
    fn insert_sets_all_timestamps_and_defaults_status() {
        let mut db = Database::open_in_memory().unwrap();
        let outcome = db.upsert_job(&full("j1")).unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome {
                created: true,
                changed: true
            }
        );

        let job = db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Active);
        assert_eq!(job.first_seen, job.last_seen);
        assert_eq!(job.created_at, job.updated_at);
        assert_eq!(job.first_seen, job.created_at);
        assert_eq!(job.salary_min_yearly, Some(120_000));
        assert_eq!(job.salary_max_yearly, Some(150_000));
    }

    #[test]
    fn unchanged_record_only_moves_last_seen() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_job(&full("j1")).unwrap();
        let first = db.get_job("j1").unwrap().unwrap();

        let outcome = db.upsert_job(&full("j1")).unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome {
                created: false,
                changed: false
            }
        );

        let second = db.get_job("j1").unwrap().unwrap();
        assert!(second.last_seen > first.last_seen);
        assert_eq!(second.updated_at, first.updated_at);
        assert_eq!(second.first_seen, first.first_seen);
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn content_change_bumps_updated_at() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_job(&full("j1")).unwrap();
        let before = db.get_job("j1").unwrap().unwrap();

        let mut changed = full("j1");
        changed.salary = Some("$130K/yr - $160K/yr".into());
        let outcome = db.upsert_job(&changed).unwrap();
        assert!(!outcome.created && outcome.changed);

        let after = db.get_job("j1").unwrap().unwrap();
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.updated_at, after.last_seen);
        assert_eq!(after.salary_min_yearly, Some(130_000));
    }

    #[test]
    fn preserve_existing_never_overwrites_description() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_job(&full("j1")).unwrap();

        let partial = JobRecord {
            title: Some("Senior Developer".into()),
            ..JobRecord::new("j1")
        };
        let outcome = db.upsert(&partial, true, None).unwrap();
        assert!(!outcome.changed);

        let job = db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.record.description.as_deref(), Some("Build scalable systems"));
        assert_eq!(job.record.company.as_deref(), Some("TechCorp"));
    }

    #[test]
    fn full_replace_clears_missing_fields() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_job(&full("j1")).unwrap();

        let outcome = db
            .upsert(
                &JobRecord {
                    title: Some("Senior Developer".into()),
                    ..JobRecord::new("j1")
                },
                false,
                None,
            )
            .unwrap();
        assert!(outcome.changed);
        assert!(db.get_job("j1").unwrap().unwrap().record.description.is_none());
    }

    #[test]
    fn missing_job_id_is_a_validation_error() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db.upsert_job(&JobRecord::new("")).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(!err.is_retryable());
        assert_eq!(db.count_jobs().unwrap(), 0);
    }

    #[test]
    fn sighting_is_recorded_even_without_change() {
        let mut db = Database::open_in_memory().unwrap();
        let s1 = db.start_session(&NewSession::default()).unwrap();
        let s2 = db.start_session(&NewSession::default()).unwrap();

        db.upsert(&full("j1"), false, Some(Sighting { session_id: s1, position: 1 }))
            .unwrap();
        let outcome = db
            .upsert(&full("j1"), false, Some(Sighting { session_id: s2, position: 5 }))
            .unwrap();
        assert!(!outcome.changed);

        let seen = db.job_sessions("j1").unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].session_id, s1);
        assert_eq!(seen[0].position, 1);
        assert_eq!(seen[1].session_id, s2);
        assert_eq!(seen[1].position, 5);
    }

    #[test]
    fn retried_upsert_does_not_double_count() {
        let mut db = Database::open_in_memory().unwrap();
        let sid = db.start_session(&NewSession::default()).unwrap();
        let sighting = Some(Sighting { session_id: sid, position: 1 });

        db.upsert(&full("j1"), false, sighting).unwrap();
        db.upsert(&full("j1"), false, sighting).unwrap();

        let session = db.get_session(sid).unwrap().unwrap();
        assert_eq!(session.jobs_seen, 1);
        assert_eq!(session.jobs_new, 1);
        assert_eq!(session.jobs_updated, 0);
        assert_eq!(db.session_jobs(sid).unwrap().len(), 1);
    }

    #[test]
    fn unknown_session_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db
            .upsert(&full("j1"), false, Some(Sighting { session_id: 42, position: 1 }))
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(db.get_job("j1").unwrap().is_none());
    }

    #[test]
    fn mark_jobs_removed_keeps_rows() {
        let mut db = Database::open_in_memory().unwrap();
        for id in ["l1", "l2", "l3", "l4"] {
            db.upsert_job(&JobRecord::new(id)).unwrap();
        }
        let mut applied = JobRecord::new("l5");
        applied.status = Some(JobStatus::Applied);
        db.upsert_job(&applied).unwrap();

        assert_eq!(db.mark_jobs_removed(&["l1", "l3"]).unwrap(), 2);
        let status = |db: &Database, id: &str| db.get_job(id).unwrap().unwrap().status();
        assert_eq!(status(&db, "l1"), JobStatus::Active);
        assert_eq!(status(&db, "l2"), JobStatus::Removed);
        assert_eq!(status(&db, "l4"), JobStatus::Removed);
        assert_eq!(status(&db, "l5"), JobStatus::Applied);
        assert_eq!(db.count_jobs().unwrap(), 5);

        // already removed jobs are not counted again
        assert_eq!(db.mark_jobs_removed::<&str>(&[]).unwrap(), 2);
    }

    #[test]
    fn removed_job_seen_again_is_active() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_job(&full("j1")).unwrap();
        db.mark_jobs_removed::<&str>(&[]).unwrap();
        assert_eq!(db.get_job("j1").unwrap().unwrap().status(), JobStatus::Removed);

        let outcome = db.upsert_job(&full("j1")).unwrap();
        assert!(outcome.changed);
        assert_eq!(db.get_job("j1").unwrap().unwrap().status(), JobStatus::Active);
    }

    #[test]
    fn applied_status_survives_rescrape() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_job(&full("j1")).unwrap();
        assert!(db.set_job_status("j1", JobStatus::Applied).unwrap());

        let outcome = db.upsert_job(&full("j1")).unwrap();
        assert!(!outcome.changed);
        assert_eq!(db.get_job("j1").unwrap().unwrap().status(), JobStatus::Applied);
    }

    #[test]
    fn purge_removes_job_and_mappings() {
        let mut db = Database::open_in_memory().unwrap();
        let sid = db.start_session(&NewSession::default()).unwrap();
        db.upsert(&full("j1"), false, Some(Sighting { session_id: sid, position: 1 }))
            .unwrap();

        assert!(db.purge_job("j1").unwrap());
        assert!(db.get_job("j1").unwrap().is_none());
        assert!(db.job_sessions("j1").unwrap().is_empty());
        assert!(!db.purge_job("j1").unwrap());
    }

    #[test]
    fn ingest_reports_rejections_and_positions() {
        let mut db = Database::open_in_memory().unwrap();
        let sid = db.start_session(&NewSession::default()).unwrap();
        db.upsert_job(&full("old")).unwrap();

        let report = db
            .ingest(sid, vec![full("new"), JobRecord::new(""), full("old")], false)
            .unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.created, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, 2);

        let mapped = db.session_jobs(sid).unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].job_id, "new");
        assert_eq!(mapped[0].position, 1);
        assert_eq!(mapped[1].job_id, "old");
        assert_eq!(mapped[1].position, 3);
    }

    #[test]
    fn ingest_documents_reports_the_decoding_error() {
        let mut db = Database::open_in_memory().unwrap();
        let sid = db.start_session(&NewSession::default()).unwrap();

        let report = db
            .ingest_documents(
                sid,
                vec![
                    serde_json::json!({"job_id": "x1", "status": "Active", "title": "Engineer"}),
                    serde_json::json!({"job_id": "x2", "status": "archived"}),
                    serde_json::json!({"title": "No key"}),
                ],
                false,
            )
            .unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.created, 1);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].0, 2);
        assert!(report.rejected[0].1.contains("unknown job status 'archived'"));
        assert_eq!(report.rejected[1].0, 3);
        assert!(report.rejected[1].1.contains("job_id"));

        assert_eq!(db.get_job("x1").unwrap().unwrap().status(), JobStatus::Active);
        assert!(db.get_job("x2").unwrap().is_none());
    }
}
