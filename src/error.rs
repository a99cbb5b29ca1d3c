//! Error types for the job store.
//!
//! Validation problems are returned to the caller straight away. Storage
//! errors are safe to retry verbatim: every write is a single transaction and
//! upserts are idempotent on identical input.

use thiserror::Error;

use crate::db::migration::MigrationBlocker;
use crate::db::schema::SchemaType;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed input (missing key, unknown session, bad status)
    #[error("Validation error: {0}")]
    Validation(String),

    /// SQLite failure (locked, full, corrupt)
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// File operations around backups
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be (de)serialized
    #[error("Document error: {0}")]
    Document(#[from] serde_json::Error),

    /// Pre-migration safety checks failed
    #[error("Migration blocked: {}", describe(.0))]
    MigrationBlocked(Vec<MigrationBlocker>),

    /// The conversion ran and was rolled back (row counts off, SQL failure)
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A write arrived while a migration holds the store
    #[error("Migration in progress: writes are rejected until it commits or is rolled back")]
    MigrationInProgress,

    /// The operation needs a different storage layout
    #[error("Operation requires the {expected} layout, but the store uses the {found} layout")]
    LayoutMismatch {
        expected: SchemaType,
        found: SchemaType,
    },
}

impl StoreError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Storage(_) | StoreError::Io(_))
    }
}

fn describe(blockers: &[MigrationBlocker]) -> String {
    blockers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
