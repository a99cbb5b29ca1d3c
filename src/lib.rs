//! Durable store for scraped job postings.
//!
//! Jobs are kept as JSON documents in SQLite with generated columns for
//! querying, an FTS5 index for text search, and a per-session audit trail of
//! which scrape saw which job. Older column-per-field stores are read as-is
//! and can be migrated in place with a verified backup.

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod models;
pub mod salary;

pub use config::StoreConfig;
pub use db::Database;
pub use db::jobs::Sighting;
pub use db::migration::{
    BackupReport, MigrationBlocker, MigrationReport, MigrationState, RollbackReport, SafetyReport,
};
pub use db::query::{DEFAULT_SEARCH_LIMIT, SearchFilter};
pub use db::schema::SchemaType;
pub use error::{StoreError, StoreResult};
pub use export::ExportFormat;
pub use models::{
    DbStats, IngestReport, JobRecord, JobSessionMapping, JobStatus, NewSession, ScrapeSession,
    StoredJob, UpsertOutcome,
};
