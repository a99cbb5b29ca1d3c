use chrono::Duration;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use std::collections::BTreeMap;

use super::schema::SchemaType;
use super::{Database, JOB_COLUMNS, JobRow, format_ts, now};
use crate::error::StoreResult;
use crate::models::{DbStats, JobStatus, StoredJob};

pub const DEFAULT_SEARCH_LIMIT: usize = 100;
const TOP_COMPANIES: i64 = 10;

/// Search predicates; unset fields do not filter.
///
/// `company` and `location` accept `|`-separated alternatives.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub query: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub work_type: Option<String>,
    pub status: Option<JobStatus>,
    pub min_salary: Option<i64>,
    pub max_salary: Option<i64>,
    pub limit: Option<usize>,
}

impl SearchFilter {
    pub fn with_query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }
}

impl Database {
    /// Jobs matching every set predicate, most recently seen first.
    pub fn search(&self, filter: &SearchFilter) -> StoreResult<Vec<StoredJob>> {
        let limit = filter.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.select_jobs(filter, Some(limit))
    }

    pub(crate) fn select_jobs(
        &self,
        filter: &SearchFilter,
        limit: Option<usize>,
    ) -> StoreResult<Vec<StoredJob>> {
        self.require_layout(SchemaType::JsonPrimary)?;

        let mut sql = format!("SELECT {} FROM jobs WHERE 1=1", JOB_COLUMNS);
        let mut params: Vec<Value> = vec![];

        if let Some(fts) = filter.query.as_deref().and_then(fts_query) {
            params.push(Value::Text(fts));
            sql.push_str(&format!(
                " AND rowid IN (SELECT rowid FROM jobs_fts WHERE jobs_fts MATCH ?{})",
                params.len()
            ));
        }

        let companies = alternatives(filter.company.as_deref());
        if !companies.is_empty() {
            let mut slots = vec![];
            for company in companies {
                params.push(Value::Text(company));
                slots.push(format!("?{}", params.len()));
            }
            sql.push_str(&format!(" AND LOWER(company) IN ({})", slots.join(", ")));
        }

        let locations = alternatives(filter.location.as_deref());
        if !locations.is_empty() {
            let mut clauses = vec![];
            for location in locations {
                params.push(Value::Text(format!("%{}%", escape_like(&location))));
                clauses.push(format!("LOWER(location) LIKE ?{} ESCAPE '\\'", params.len()));
            }
            sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
        }

        if let Some(work_type) = filter.work_type.as_deref().map(str::trim) {
            if !work_type.is_empty() {
                params.push(Value::Text(work_type.to_lowercase()));
                sql.push_str(&format!(" AND LOWER(work_type) = ?{}", params.len()));
            }
        }

        if let Some(status) = filter.status {
            params.push(Value::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", params.len()));
        }

        if let Some(min) = filter.min_salary {
            params.push(Value::Integer(min));
            sql.push_str(&format!(" AND salary_max_yearly >= ?{}", params.len()));
        }

        if let Some(max) = filter.max_salary {
            params.push(Value::Integer(max));
            sql.push_str(&format!(" AND salary_min_yearly <= ?{}", params.len()));
        }

        sql.push_str(" ORDER BY last_seen DESC, job_id");
        if let Some(limit) = limit {
            params.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), JobRow::from_row)?;
        rows.map(|row| row?.into_stored()).collect()
    }

    pub fn stats(&self) -> StoreResult<DbStats> {
        self.require_layout(SchemaType::JsonPrimary)?;
        let count = |sql: &str, params: &[&dyn rusqlite::ToSql]| -> StoreResult<i64> {
            Ok(self.conn.query_row(sql, params, |row| row.get(0))?)
        };
        let grouped = |sql: &str| -> StoreResult<BTreeMap<String, i64>> {
            let mut stmt = self.conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        };

        let week_ago = format_ts(now() - Duration::days(7));
        Ok(DbStats {
            total_jobs: count("SELECT COUNT(*) FROM jobs", &[])?,
            active_jobs: count("SELECT COUNT(*) FROM jobs WHERE status = 'active'", &[])?,
            jobs_by_status: grouped("SELECT status, COUNT(*) FROM jobs GROUP BY status")?,
            work_types: grouped(
                "SELECT COALESCE(NULLIF(TRIM(work_type), ''), 'Unknown'), COUNT(*)
                 FROM jobs WHERE status = 'active' GROUP BY 1",
            )?,
            top_companies: grouped(&format!(
                "SELECT company, COUNT(*) AS n FROM jobs
                 WHERE status = 'active' AND company IS NOT NULL AND TRIM(company) != ''
                 GROUP BY company ORDER BY n DESC, company LIMIT {}",
                TOP_COMPANIES
            ))?,
            total_sessions: count("SELECT COUNT(*) FROM scrape_sessions", &[])?,
            jobs_seen_last_7_days: count(
                "SELECT COUNT(*) FROM jobs WHERE last_seen >= ?1",
                &[&week_ago],
            )?,
        })
    }
}

/// Quote every whitespace-separated term so FTS5 syntax in user input is
/// matched literally. Terms are ANDed.
fn fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn alternatives(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split('|')
            .map(|part| part.trim().to_lowercase())
            .filter(|part| !part.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
