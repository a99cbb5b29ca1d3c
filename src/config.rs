use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

pub const DB_ENV: &str = "JOBSTASH_DB";
pub const BACKUP_DIR_ENV: &str = "JOBSTASH_BACKUP_DIR";
pub const BUSY_TIMEOUT_ENV: &str = "JOBSTASH_BUSY_TIMEOUT_MS";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the store lives and how it waits on locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Migration backups go next to the database file when unset.
    pub backup_dir: Option<PathBuf>,
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_path(),
            backup_dir: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> StoreResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StoreResult<Self> {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = set(DB_ENV) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(dir) = set(BACKUP_DIR_ENV) {
            config.backup_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = set(BUSY_TIMEOUT_ENV) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                StoreError::Validation(format!("{} must be milliseconds, got '{}'", BUSY_TIMEOUT_ENV, ms))
            })?;
            config.busy_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn with_db_path(mut self, path: impl AsRef<Path>) -> Self {
        self.db_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_backup_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.backup_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

fn default_path() -> PathBuf {
    // XDG data directory, or the working directory
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobstash") {
        proj_dirs.data_dir().join("jobstash.db")
    } else {
        PathBuf::from("jobstash.db")
    }
}
