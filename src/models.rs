use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{StoreError, StoreResult};
use crate::salary::parse_salary;

/// Lifecycle status of a posting. Parsed case-insensitively everywhere,
/// serialized lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum JobStatus {
    Active,
    Removed,
    Applied,
    Interviewed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Active,
        JobStatus::Removed,
        JobStatus::Applied,
        JobStatus::Interviewed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Removed => "removed",
            JobStatus::Applied => "applied",
            JobStatus::Interviewed => "interviewed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| StoreError::Validation(format!("unknown job status '{}'", s)))
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse()
            .map_err(|_| format!("unknown job status '{}'", value))
    }
}

/// A job posting as handed to the store.
///
/// Everything but `job_id` is optional so that a partial listing (no
/// description, no salary) can be upserted without inventing values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub work_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default)]
    pub benefits: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub source: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    /// Rejects records that cannot be keyed.
    pub fn validate(&self) -> StoreResult<()> {
        if self.job_id.trim().is_empty() {
            return Err(StoreError::Validation(
                "job record is missing job_id".to_string(),
            ));
        }
        Ok(())
    }

    pub fn salary_range(&self) -> (Option<i64>, Option<i64>) {
        parse_salary(self.salary.as_deref())
    }

    /// The canonical JSON document stored in `jobs.json_data`.
    ///
    /// The two yearly salary fields are derived from `salary` on every call
    /// and are ignored by [`JobRecord::from_document`].
    pub fn to_document(&self) -> Value {
        let (salary_min, salary_max) = self.salary_range();
        let mut doc = Map::new();
        doc.insert("job_id".into(), Value::String(self.job_id.clone()));
        doc.insert("title".into(), opt_string(&self.title));
        doc.insert("company".into(), opt_string(&self.company));
        doc.insert("work_type".into(), opt_string(&self.work_type));
        doc.insert("location".into(), opt_string(&self.location));
        doc.insert("salary".into(), opt_string(&self.salary));
        doc.insert("benefits".into(), opt_string(&self.benefits));
        doc.insert("url".into(), opt_string(&self.url));
        doc.insert("description".into(), opt_string(&self.description));
        doc.insert(
            "status".into(),
            self.status
                .map(|s| Value::String(s.as_str().to_string()))
                .unwrap_or(Value::Null),
        );
        doc.insert("source".into(), opt_string(&self.source));
        doc.insert("salary_min_yearly".into(), salary_min.into());
        doc.insert("salary_max_yearly".into(), salary_max.into());
        Value::Object(doc)
    }

    pub fn from_document(doc: &Value) -> StoreResult<Self> {
        let has_key = doc
            .get("job_id")
            .and_then(Value::as_str)
            .is_some_and(|id| !id.trim().is_empty());
        if !has_key {
            return Err(StoreError::Validation(
                "document is missing job_id".to_string(),
            ));
        }
        serde_json::from_value(doc.clone())
            .map_err(|e| StoreError::Validation(format!("malformed job document: {}", e)))
    }

    /// Fill every absent (or blank) field of `self` from `existing`.
    pub fn fill_from(mut self, existing: &JobRecord) -> Self {
        fill(&mut self.title, &existing.title);
        fill(&mut self.company, &existing.company);
        fill(&mut self.work_type, &existing.work_type);
        fill(&mut self.location, &existing.location);
        fill(&mut self.salary, &existing.salary);
        fill(&mut self.benefits, &existing.benefits);
        fill(&mut self.url, &existing.url);
        fill(&mut self.description, &existing.description);
        fill(&mut self.source, &existing.source);
        if self.status.is_none() {
            self.status = existing.status;
        }
        self
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

// Empty strings count as missing: a listing card that renders "" for the
// description must not wipe the full text fetched earlier.
fn fill(slot: &mut Option<String>, existing: &Option<String>) {
    let missing = slot.as_deref().is_none_or(|v| v.trim().is_empty());
    if missing && existing.is_some() {
        *slot = existing.clone();
    }
}

/// A job as stored, with the storage-maintained columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    #[serde(flatten)]
    pub record: JobRecord,
    pub salary_min_yearly: Option<i64>,
    pub salary_max_yearly: Option<i64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredJob {
    pub fn status(&self) -> JobStatus {
        self.record.status.unwrap_or(JobStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub created: bool,
    pub changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    pub source: Option<String>,
    pub search_criteria: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSession {
    pub session_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub jobs_seen: i64,
    pub jobs_new: i64,
    pub jobs_updated: i64,
    pub jobs_removed: i64,
    pub source: Option<String>,
    pub search_criteria: Option<String>,
    pub notes: Option<String>,
}

impl ScrapeSession {
    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSessionMapping {
    pub job_id: String,
    pub session_id: i64,
    pub position: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub session_id: i64,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// `(position, reason)` for records that failed validation.
    pub rejected: Vec<(i64, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DbStats {
    pub total_jobs: i64,
    pub active_jobs: i64,
    pub jobs_by_status: BTreeMap<String, i64>,
    pub work_types: BTreeMap<String, i64>,
    pub top_companies: BTreeMap<String, i64>,
    pub total_sessions: i64,
    pub jobs_seen_last_7_days: i64,
}
