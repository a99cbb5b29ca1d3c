use std::io::Write;

use crate::db::Database;
use crate::db::query::SearchFilter;
use crate::db::format_ts;
use crate::error::StoreResult;
use crate::models::StoredJob;

pub const CSV_HEADER: [&str; 17] = [
    "job_id",
    "title",
    "company",
    "work_type",
    "location",
    "salary",
    "salary_min_yearly",
    "salary_max_yearly",
    "benefits",
    "url",
    "description",
    "status",
    "source",
    "first_seen",
    "last_seen",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl Database {
    /// Write every job matching `filter` (its limit is ignored). Returns the
    /// number of jobs written.
    pub fn export<W: Write>(
        &self,
        filter: &SearchFilter,
        format: ExportFormat,
        writer: &mut W,
    ) -> StoreResult<usize> {
        let jobs = self.select_jobs(filter, None)?;
        match format {
            ExportFormat::Csv => write_csv(&jobs, writer)?,
            ExportFormat::Json => write_json(&jobs, writer)?,
        }
        writer.flush()?;
        Ok(jobs.len())
    }
}

pub fn write_csv<W: Write>(jobs: &[StoredJob], writer: &mut W) -> StoreResult<()> {
    writeln!(writer, "{}", CSV_HEADER.join(","))?;
    for job in jobs {
        let r = &job.record;
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        let num = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_default();
        let fields = [
            r.job_id.clone(),
            opt(&r.title),
            opt(&r.company),
            opt(&r.work_type),
            opt(&r.location),
            opt(&r.salary),
            num(job.salary_min_yearly),
            num(job.salary_max_yearly),
            opt(&r.benefits),
            opt(&r.url),
            opt(&r.description),
            job.status().to_string(),
            opt(&r.source),
            format_ts(job.first_seen),
            format_ts(job.last_seen),
            format_ts(job.created_at),
            format_ts(job.updated_at),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        writeln!(writer, "{}", line.join(","))?;
    }
    Ok(())
}

pub fn write_json<W: Write>(jobs: &[StoredJob], writer: &mut W) -> StoreResult<()> {
    serde_json::to_writer_pretty(&mut *writer, jobs)?;
    writeln!(writer)?;
    Ok(())
}

/// RFC 4180: quote when the value holds a comma, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
