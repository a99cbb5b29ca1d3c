use jobstash::{
    Database, ExportFormat, JobRecord, JobStatus, MigrationBlocker, MigrationState, NewSession,
    SchemaType, SearchFilter, StoreConfig, StoreError,
};
use rusqlite::Connection;
use rusqlite::types::Value;
use std::path::Path;
use tempfile::TempDir;

const LEGACY_SCHEMA: &str = r#"
    CREATE TABLE jobs (
        job_id TEXT PRIMARY KEY,
        title TEXT,
        company TEXT,
        work_type TEXT,
        location TEXT,
        salary TEXT,
        benefits TEXT,
        url TEXT,
        description TEXT,
        status TEXT DEFAULT 'active',
        source TEXT,
        salary_min_yearly INTEGER,
        salary_max_yearly INTEGER,
        first_seen TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        last_seen TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX idx_jobs_company ON jobs(company);

    CREATE TABLE scrape_sessions (
        session_id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TIMESTAMP NOT NULL,
        total_jobs_found INTEGER NOT NULL,
        new_jobs_added INTEGER DEFAULT 0,
        source TEXT DEFAULT 'linkedin',
        search_criteria TEXT,
        notes TEXT
    );

    CREATE TABLE job_session_mapping (
        job_id TEXT,
        session_id INTEGER,
        position_in_results INTEGER
    );
"#;

fn legacy_store(dir: &TempDir, jobs: usize) -> std::path::PathBuf {
    let path = dir.path().join("jobs.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(LEGACY_SCHEMA).unwrap();
    for i in 0..jobs {
        conn.execute(
            "INSERT INTO jobs (job_id, title, company, work_type, location, salary, description, status, source, first_seen, last_seen)
             VALUES (?1, ?2, ?3, 'Remote', 'Austin, TX', ?4, 'Rust services', 'active', 'linkedin',
                     '2024-01-15 10:30:00', '2024-02-01 08:00:00')",
            rusqlite::params![
                format!("legacy_{}", i),
                format!("Engineer {}", i),
                if i % 2 == 0 { "Acme" } else { "Globex" },
                format!("${}K/yr - ${}K/yr", 100 + i, 120 + i),
            ],
        )
        .unwrap();
    }
    conn.execute(
        "INSERT INTO scrape_sessions (timestamp, total_jobs_found, new_jobs_added, notes)
         VALUES ('2024-02-01 08:00:00', 5, 2, 'Test session')",
        [],
    )
    .unwrap();
    let session_id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO job_session_mapping (job_id, session_id, position_in_results)
         VALUES ('legacy_0', ?1, 1)",
        [session_id],
    )
    .unwrap();
    path
}

fn dump_jobs(path: &Path) -> Vec<Vec<Value>> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY job_id").unwrap();
    let columns = stmt.column_count();
    stmt.query_map([], |row| {
        (0..columns)
            .map(|i| row.get::<_, Value>(i))
            .collect::<rusqlite::Result<Vec<Value>>>()
    })
    .unwrap()
    .collect::<Result<Vec<_>, _>>()
    .unwrap()
}

#[test]
fn legacy_store_is_read_only_until_migrated() {
    let dir = TempDir::new().unwrap();
    let path = legacy_store(&dir, 3);
    let mut db = Database::open_at(&path).unwrap();

    assert_eq!(db.schema_type(), SchemaType::Columnar);
    let job = db.get_job("legacy_1").unwrap().unwrap();
    assert_eq!(job.record.company.as_deref(), Some("Globex"));
    assert_eq!(job.salary_min_yearly, Some(101_000));
    assert!(job.first_seen <= job.last_seen);

    assert!(matches!(
        db.upsert_job(&JobRecord::new("new")),
        Err(StoreError::LayoutMismatch { .. })
    ));
    assert!(matches!(
        db.search(&SearchFilter::default()),
        Err(StoreError::LayoutMismatch { .. })
    ));
}

#[test]
fn migration_preserves_every_legacy_row() {
    let dir = TempDir::new().unwrap();
    let path = legacy_store(&dir, 5);
    let mut db = Database::open_at(&path).unwrap();

    let report = db.migrate_to_json_schema().unwrap();
    assert!(report.success, "{:?}", report);
    assert_eq!(report.jobs_migrated, 5);
    assert_eq!(report.sessions_migrated, 1);
    assert_eq!(report.mappings_migrated, 1);
    assert!(report.backup_path.as_ref().is_some_and(|p| p.exists()));

    assert_eq!(db.schema_type(), SchemaType::JsonPrimary);
    assert_eq!(db.migration_state().unwrap(), MigrationState::Committed);
    assert_eq!(db.count_jobs().unwrap(), 5);

    let job = db.get_job("legacy_3").unwrap().unwrap();
    assert_eq!(job.record.title.as_deref(), Some("Engineer 3"));
    assert_eq!(job.record.location.as_deref(), Some("Austin, TX"));
    assert_eq!(job.salary_min_yearly, Some(103_000));
    assert_eq!(job.salary_max_yearly, Some(123_000));
    assert!(job.first_seen < job.last_seen);

    let sessions = db.list_sessions(10).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].jobs_seen, 5);
    assert_eq!(sessions[0].jobs_new, 2);
    assert_eq!(sessions[0].notes.as_deref(), Some("Test session"));
    assert!(sessions[0].is_closed());
    assert_eq!(db.job_sessions("legacy_0").unwrap().len(), 1);

    let found = db.search(&SearchFilter::with_query("engineer")).unwrap();
    assert_eq!(found.len(), 5);

    // writes work and survive a reopen
    db.upsert_job(&JobRecord::new("fresh")).unwrap();
    drop(db);
    let db = Database::open_at(&path).unwrap();
    assert_eq!(db.schema_type(), SchemaType::JsonPrimary);
    assert_eq!(db.count_jobs().unwrap(), 6);
}

#[test]
fn failed_migration_blocks_writes_and_rolls_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(&LEGACY_SCHEMA.replace("job_id TEXT PRIMARY KEY", "job_id TEXT"))
            .unwrap();
        conn.execute_batch(
            "INSERT INTO jobs (job_id, title, status) VALUES ('ok_1', 'Kept', 'active');
             INSERT INTO jobs (job_id, title, status) VALUES ('ok_2', 'Also kept', 'applied');
             INSERT INTO jobs (job_id, title, status) VALUES (NULL, 'No key', 'active');",
        )
        .unwrap();
    }
    let before = dump_jobs(&path);

    let mut db = Database::open_at(&path).unwrap();
    let report = db.migrate_to_json_schema().unwrap();
    assert!(!report.success);
    assert!(report.error.is_some());
    assert!(report.blockers.is_empty());
    assert_eq!(db.migration_state().unwrap(), MigrationState::Migrating);
    assert_eq!(db.schema_type(), SchemaType::Columnar);
    assert!(matches!(
        report.into_result(),
        Err(StoreError::MigrationFailed(_))
    ));

    let err = db.upsert_job(&JobRecord::new("during")).unwrap_err();
    assert!(matches!(err, StoreError::MigrationInProgress));

    let again = db.migrate_to_json_schema().unwrap();
    assert!(again.blockers.contains(&MigrationBlocker::MigrationInProgress));

    let rollback = db.rollback_migration().unwrap();
    assert!(rollback.success, "{:?}", rollback);
    assert_eq!(rollback.previous_state, MigrationState::Migrating);
    assert_eq!(rollback.jobs_restored, 3);
    assert_eq!(db.migration_state().unwrap(), MigrationState::NotStarted);
    assert_eq!(db.schema_type(), SchemaType::Columnar);

    assert_eq!(dump_jobs(&path), before);
}

#[test]
fn rollback_allowed_until_first_write_after_commit() {
    let dir = TempDir::new().unwrap();
    let path = legacy_store(&dir, 4);
    let before = dump_jobs(&path);
    let mut db = Database::open_at(&path).unwrap();

    assert!(db.migrate_to_json_schema().unwrap().success);
    let rollback = db.rollback_migration().unwrap();
    assert!(rollback.success);
    assert_eq!(rollback.previous_state, MigrationState::Committed);
    assert_eq!(db.schema_type(), SchemaType::Columnar);
    assert_eq!(dump_jobs(&path), before);

    assert!(db.migrate_to_json_schema().unwrap().success);
    db.set_job_status("legacy_0", JobStatus::Applied).unwrap();
    let refused = db.rollback_migration().unwrap();
    assert!(!refused.success);
    assert!(refused.reason.is_some());
    assert_eq!(db.schema_type(), SchemaType::JsonPrimary);
}

#[test]
fn safety_check_reports_blockers_and_missing_columns() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("odd.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE jobs (id INTEGER PRIMARY KEY, title TEXT);
             INSERT INTO jobs (title) VALUES ('Keyless');",
        )
        .unwrap();
    }
    let mut db = Database::open_at(&path).unwrap();

    let report = db.validate_migration_safety().unwrap();
    assert!(!report.safe);
    assert!(report.blockers.contains(&MigrationBlocker::MissingKeyColumn));
    assert!(report.blockers.contains(&MigrationBlocker::NoVerifiedBackup));
    assert!(report.missing_columns.iter().any(|c| c == "company"));
    assert!(!report.missing_columns.iter().any(|c| c == "title"));
    assert_eq!(report.legacy_rows, 1);

    let migrated = db.migrate_to_json_schema().unwrap();
    assert!(!migrated.success);
    assert_eq!(migrated.blockers.len(), 2);
    assert_eq!(migrated.blockers[0], MigrationBlocker::MissingKeyColumn);
    assert!(matches!(
        &migrated.blockers[1],
        MigrationBlocker::MissingColumns { columns } if columns.iter().any(|c| c == "company")
    ));
    assert_eq!(db.count_jobs().unwrap(), 1);
}

#[test]
fn missing_expected_columns_make_migration_unsafe() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("partial.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE jobs (
                 job_id TEXT PRIMARY KEY,
                 title TEXT,
                 created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
             );
             INSERT INTO jobs (job_id, title) VALUES ('p1', 'Partial');",
        )
        .unwrap();
    }
    let mut db = Database::open_at(&path).unwrap();
    assert!(db.create_migration_backup().unwrap().success);

    let report = db.validate_migration_safety().unwrap();
    assert!(!report.safe);
    assert!(!report.missing_columns.is_empty());
    assert!(!report.missing_columns.iter().any(|c| c == "created_at"));
    assert_eq!(
        report.blockers,
        vec![MigrationBlocker::MissingColumns {
            columns: report.missing_columns.clone()
        }]
    );
    assert_eq!(db.migration_state().unwrap(), MigrationState::BackedUp);

    let migrated = db.migrate_to_json_schema().unwrap();
    assert!(!migrated.success);
    assert_eq!(db.schema_type(), SchemaType::Columnar);
    assert_eq!(db.get_job("p1").unwrap().unwrap().record.title.as_deref(), Some("Partial"));
}

#[test]
fn migration_backs_up_rows_written_after_an_earlier_backup() {
    let dir = TempDir::new().unwrap();
    let path = legacy_store(&dir, 2);
    let mut db = Database::open_at(&path).unwrap();
    let early = db.create_migration_backup().unwrap();
    assert!(early.success);

    let writer = Connection::open(&path).unwrap();
    writer
        .execute(
            "INSERT INTO jobs (job_id, title, salary) VALUES ('late', 'Added later', '$90K/yr')",
            [],
        )
        .unwrap();
    drop(writer);
    let before = dump_jobs(&path);

    let report = db.migrate_to_json_schema().unwrap();
    assert!(report.success, "{:?}", report);
    assert_eq!(report.jobs_migrated, 3);
    assert_ne!(report.backup_path, early.backup_path);

    let rollback = db.rollback_migration().unwrap();
    assert!(rollback.success, "{:?}", rollback);
    assert_eq!(rollback.jobs_restored, 3);
    assert_eq!(db.schema_type(), SchemaType::Columnar);
    let late = db.get_job("late").unwrap().unwrap();
    assert_eq!(late.record.title.as_deref(), Some("Added later"));
    assert_eq!(dump_jobs(&path), before);
}

#[test]
fn backup_after_commit_keeps_the_legacy_copy() {
    let dir = TempDir::new().unwrap();
    let path = legacy_store(&dir, 3);
    let mut db = Database::open_at(&path).unwrap();

    let report = db.migrate_to_json_schema().unwrap();
    assert!(report.success);
    let legacy_copy = db.verified_backup().unwrap();
    assert_eq!(legacy_copy, report.backup_path);

    let refused = db.create_migration_backup().unwrap();
    assert!(!refused.success);
    assert!(refused.error.is_some());
    assert_eq!(db.verified_backup().unwrap(), legacy_copy);
    assert_eq!(db.migration_state().unwrap(), MigrationState::Committed);

    let rollback = db.rollback_migration().unwrap();
    assert!(rollback.success);
    assert_eq!(rollback.restored_from, legacy_copy);
    assert_eq!(db.schema_type(), SchemaType::Columnar);
    assert_eq!(db.count_jobs().unwrap(), 3);
}

#[test]
fn backup_is_an_independent_copy() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::default()
        .with_db_path(dir.path().join("store.db"))
        .with_backup_dir(dir.path().join("backups"));
    let mut db = Database::open(&config).unwrap();
    db.upsert_job(&JobRecord::new("a")).unwrap();
    db.upsert_job(&JobRecord::new("b")).unwrap();

    let report = db.create_migration_backup().unwrap();
    assert!(report.success);
    let backup = report.backup_path.unwrap();
    assert!(backup.starts_with(dir.path().join("backups")));
    assert!(
        backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("store.db.backup-")
    );
    assert_eq!(report.table_counts.get("jobs"), Some(&2));
    assert_eq!(db.migration_state().unwrap(), MigrationState::BackedUp);

    db.upsert_job(&JobRecord::new("c")).unwrap();
    let copy = Connection::open(&backup).unwrap();
    let rows: i64 = copy
        .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 2);
}

#[test]
fn scrape_lifecycle_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("life.db");
    let mut db = Database::open_at(&path).unwrap();

    let listing = |id: &str, company: &str, salary: &str| JobRecord {
        title: Some("Backend Engineer".into()),
        company: Some(company.into()),
        location: Some("Remote, US".into()),
        salary: Some(salary.into()),
        ..JobRecord::new(id)
    };

    let first = db
        .start_session(&NewSession {
            source: Some("linkedin".into()),
            search_criteria: Some("backend".into()),
            notes: None,
        })
        .unwrap();
    db.ingest(
        first,
        vec![
            listing("l1", "Acme", "$90K/yr - $110K/yr"),
            listing("l2", "Globex", "$150K/yr"),
            listing("l3", "Initech", "DOE"),
        ],
        false,
    )
    .unwrap();
    db.close_session(first, true).unwrap();

    let second = db.start_session(&NewSession::default()).unwrap();
    db.ingest(second, vec![listing("l1", "Acme", "$95K/yr - $110K/yr")], true)
        .unwrap();
    let closed = db.close_session(second, true).unwrap();
    assert_eq!(closed.jobs_seen, 1);
    assert_eq!(closed.jobs_updated, 1);
    assert_eq!(closed.jobs_removed, 2);
    drop(db);

    let db = Database::open_at(&path).unwrap();
    assert_eq!(db.count_jobs().unwrap(), 3);
    assert_eq!(db.get_job("l2").unwrap().unwrap().status(), JobStatus::Removed);
    assert_eq!(db.job_sessions("l1").unwrap().len(), 2);
    assert_eq!(db.job_sessions("l2").unwrap().len(), 1);

    let high = db
        .search(&SearchFilter {
            min_salary: Some(100_000),
            company: Some("acme|globex".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(high.len(), 2);

    let active = db
        .search(&SearchFilter {
            status: Some(JobStatus::Active),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].salary_min_yearly, Some(95_000));

    let stats = db.stats().unwrap();
    assert_eq!(stats.total_jobs, 3);
    assert_eq!(stats.active_jobs, 1);
    assert_eq!(stats.total_sessions, 2);

    let mut csv = Vec::new();
    assert_eq!(
        db.export(&SearchFilter::default(), ExportFormat::Csv, &mut csv)
            .unwrap(),
        3
    );
    assert_eq!(String::from_utf8(csv).unwrap().lines().count(), 4);
}
