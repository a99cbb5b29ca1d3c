use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use jobstash::{
    Database, ExportFormat, JobStatus, NewSession, SchemaType, SearchFilter,
    StoreConfig, StoredJob,
};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "jobstash")]
#[command(about = "Durable store for scraped job postings - ingest, search, export, migrate")]
struct Cli {
    /// Database file (overrides JOBSTASH_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and its schema
    Init,

    /// Store the results of one scrape as a new session
    Ingest {
        /// JSON array or JSON-lines file of job records
        file: PathBuf,

        /// Provenance tag for the session (e.g. linkedin)
        #[arg(long)]
        source: Option<String>,

        /// Free-form notes for the session
        #[arg(long)]
        notes: Option<String>,

        /// Search criteria that produced these results
        #[arg(long)]
        criteria: Option<String>,

        /// Keep stored values for fields missing from the file
        #[arg(long)]
        preserve_existing: bool,

        /// Mark active jobs missing from this scrape as removed
        #[arg(long)]
        mark_removed: bool,
    },

    /// Search stored jobs
    Search {
        /// Full-text terms matched against title, company and description
        query: Option<String>,

        #[command(flatten)]
        filters: FilterArgs,

        /// Maximum number of results
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Show one job and the sessions that saw it
    Show {
        /// Job ID
        job_id: String,
    },

    /// Set a job's status (active, removed, applied, interviewed)
    Status {
        /// Job ID
        job_id: String,

        /// New status
        status: String,
    },

    /// Export matching jobs
    Export {
        #[arg(short, long, value_enum)]
        format: ExportFormat,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Full-text terms
        #[arg(short, long)]
        query: Option<String>,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Show database statistics
    DbStats,

    /// List recent scrape sessions
    Sessions {
        /// Number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Inspect or run the legacy-to-JSON migration
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },

    /// Rebuild the full-text index from stored documents
    Reindex,
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Show the storage layout and migration state
    Detect,

    /// Run the pre-migration safety checks
    Check,

    /// Take a verified backup
    Backup,

    /// Back up, check and convert the store
    Run,

    /// Restore the pre-migration backup
    Rollback,
}

#[derive(Args)]
struct FilterArgs {
    /// Company name, exact; separate alternatives with |
    #[arg(short, long)]
    company: Option<String>,

    /// Location substring; separate alternatives with |
    #[arg(long)]
    location: Option<String>,

    /// Work type (Remote, Hybrid, On-site)
    #[arg(short, long)]
    work_type: Option<String>,

    /// Filter by status (active, removed, applied, interviewed)
    #[arg(short, long)]
    status: Option<String>,

    /// Minimum yearly salary
    #[arg(long)]
    min_salary: Option<i64>,

    /// Maximum yearly salary
    #[arg(long)]
    max_salary: Option<i64>,
}

impl FilterArgs {
    fn into_filter(self, query: Option<String>, limit: Option<usize>) -> Result<SearchFilter> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()?;
        Ok(SearchFilter {
            query,
            company: self.company,
            location: self.location,
            work_type: self.work_type,
            status,
            min_salary: self.min_salary,
            max_salary: self.max_salary,
            limit,
        })
    }
}

/// Parse a JSON array or one JSON object per line.
///
/// Documents are decoded by ingest so that a bad one is reported with its
/// position and reason.
fn read_documents(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(&content).context("Failed to parse JSON array");
    }
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid JSON on line {}", n + 1))
        })
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = StoreConfig::from_env().context("Failed to load configuration")?;
    if let Some(path) = cli.db {
        config = config.with_db_path(path);
    }
    let mut db = Database::open(&config)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;

    match cli.command {
        Commands::Init => {
            println!(
                "Database initialized at {} ({} layout)",
                db.path().display(),
                db.schema_type()
            );
        }

        Commands::Ingest {
            file,
            source,
            notes,
            criteria,
            preserve_existing,
            mark_removed,
        } => {
            let documents = read_documents(&file)?;
            let session_id = db.start_session(&NewSession {
                source,
                search_criteria: criteria,
                notes,
            })?;
            let report = db.ingest_documents(session_id, documents, preserve_existing)?;
            let session = db.close_session(session_id, mark_removed)?;

            println!("Session #{}", session_id);
            println!(
                "  processed {}, new {}, updated {}, unchanged {}, removed {}",
                report.processed,
                report.created,
                report.updated,
                report.unchanged,
                session.jobs_removed
            );
            for (position, reason) in &report.rejected {
                println!("  rejected #{}: {}", position, reason);
            }
        }

        Commands::Search {
            query,
            filters,
            limit,
        } => {
            let filter = filters.into_filter(query, Some(limit))?;
            let jobs = db.search(&filter)?;
            print_jobs(&jobs);
        }

        Commands::Show { job_id } => match db.get_job(&job_id)? {
            Some(job) => {
                print_job(&job);
                if db.schema_type() == SchemaType::JsonPrimary {
                    let seen = db.job_sessions(&job_id)?;
                    if !seen.is_empty() {
                        println!("\nSeen in sessions:");
                        for m in seen {
                            println!("  #{} at position {}", m.session_id, m.position);
                        }
                    }
                }
            }
            None => bail!("Job {} not found", job_id),
        },

        Commands::Status { job_id, status } => {
            let status: JobStatus = status.parse()?;
            if db.set_job_status(&job_id, status)? {
                println!("Job {} is now {}", job_id, status);
            } else {
                bail!("Job {} not found", job_id);
            }
        }

        Commands::Export {
            format,
            output,
            query,
            filters,
        } => {
            let filter = filters.into_filter(query, None)?;
            let written = match &output {
                Some(path) => {
                    let file = File::create(path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    let mut writer = BufWriter::new(file);
                    db.export(&filter, format, &mut writer)?
                }
                None => {
                    let stdout = io::stdout();
                    let mut writer = stdout.lock();
                    db.export(&filter, format, &mut writer)?
                }
            };
            if let Some(path) = output {
                println!("Exported {} jobs to {}", written, path.display());
            }
        }

        Commands::DbStats => {
            let stats = db.stats()?;
            println!("Database: {}", db.path().display());
            println!("Total jobs:     {}", stats.total_jobs);
            println!("Active jobs:    {}", stats.active_jobs);
            println!("Seen in 7 days: {}", stats.jobs_seen_last_7_days);
            println!("Sessions:       {}", stats.total_sessions);
            println!("\nBy status:");
            for (status, count) in &stats.jobs_by_status {
                println!("  {:<14} {:>6}", status, count);
            }
            println!("\nWork types (active):");
            for (work_type, count) in &stats.work_types {
                println!("  {:<14} {:>6}", work_type, count);
            }
            let mut companies: Vec<_> = stats.top_companies.iter().collect();
            companies.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            println!("\nTop companies (active):");
            for (company, count) in companies {
                println!("  {:<30} {:>6}", truncate(company, 28), count);
            }
        }

        Commands::Sessions { limit } => {
            let sessions = db.list_sessions(limit)?;
            if sessions.is_empty() {
                println!("No sessions found.");
            } else {
                println!(
                    "{:<6} {:<20} {:>6} {:>6} {:>8} {:>8}  {}",
                    "ID", "STARTED", "SEEN", "NEW", "UPDATED", "REMOVED", "CRITERIA"
                );
                println!("{}", "-".repeat(84));
                for s in sessions {
                    println!(
                        "{:<6} {:<20} {:>6} {:>6} {:>8} {:>8}  {}",
                        s.session_id,
                        s.started_at.format("%Y-%m-%d %H:%M:%S"),
                        s.jobs_seen,
                        s.jobs_new,
                        s.jobs_updated,
                        s.jobs_removed,
                        truncate(s.search_criteria.as_deref().unwrap_or("-"), 28)
                    );
                }
            }
        }

        Commands::Migrate { command } => run_migrate(&mut db, command)?,

        Commands::Reindex => {
            let rows = db.rebuild_search_index()?;
            println!("Re-indexed {} jobs", rows);
        }
    }

    Ok(())
}

fn run_migrate(db: &mut Database, command: MigrateCommands) -> Result<()> {
    match command {
        MigrateCommands::Detect => {
            println!("Layout:          {}", db.detect_schema_type()?);
            println!("Migration state: {}", db.migration_state()?);
            if let Some(path) = db.verified_backup()? {
                println!("Last backup:     {}", path.display());
            }
        }

        MigrateCommands::Check => {
            let report = db.validate_migration_safety()?;
            println!("Safe to migrate: {}", if report.safe { "yes" } else { "no" });
            println!("Legacy rows:     {}", report.legacy_rows);
            for blocker in &report.blockers {
                println!("  blocker: {}", blocker);
            }
            for warning in &report.warnings {
                println!("  warning: {}", warning);
            }
        }

        MigrateCommands::Backup => {
            let report = db.create_migration_backup()?;
            match (&report.backup_path, &report.error) {
                (Some(path), _) => println!("Backup written to {}", path.display()),
                (None, Some(reason)) => bail!("Backup failed: {}", reason),
                (None, None) => bail!("Backup failed"),
            }
        }

        MigrateCommands::Run => {
            let report = db.migrate_to_json_schema()?;
            for warning in &report.warnings {
                println!("  warning: {}", warning);
            }
            let report = report.into_result().context("Migration did not complete")?;
            println!(
                "Migrated {} jobs, {} sessions, {} session mappings",
                report.jobs_migrated, report.sessions_migrated, report.mappings_migrated
            );
            if let Some(path) = report.backup_path {
                println!("Backup kept at {}", path.display());
            }
        }

        MigrateCommands::Rollback => {
            let report = db.rollback_migration()?;
            if !report.success {
                bail!(
                    "Rollback refused: {}",
                    report.reason.unwrap_or_else(|| "unknown reason".to_string())
                );
            }
            println!(
                "Rolled back from {} state; {} jobs restored",
                report.previous_state, report.jobs_restored
            );
        }
    }
    Ok(())
}

fn print_jobs(jobs: &[StoredJob]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!(
        "{:<12} {:<12} {:<30} {:<20} {:>12}",
        "ID", "STATUS", "TITLE", "COMPANY", "SALARY"
    );
    println!("{}", "-".repeat(90));
    for job in jobs {
        println!(
            "{:<12} {:<12} {:<30} {:<20} {:>12}",
            truncate(&job.record.job_id, 12),
            job.status(),
            truncate(job.record.title.as_deref().unwrap_or("-"), 28),
            truncate(job.record.company.as_deref().unwrap_or("-"), 18),
            salary_range(job)
        );
    }
}

fn print_job(job: &StoredJob) {
    let r = &job.record;
    println!("Job {}", r.job_id);
    println!("Title: {}", r.title.as_deref().unwrap_or("-"));
    if let Some(company) = &r.company {
        println!("Company: {}", company);
    }
    println!("Status: {}", job.status());
    for (label, value) in [
        ("Work type", &r.work_type),
        ("Location", &r.location),
        ("Salary", &r.salary),
        ("Benefits", &r.benefits),
        ("URL", &r.url),
        ("Source", &r.source),
    ] {
        if let Some(value) = value {
            println!("{}: {}", label, value);
        }
    }
    println!("First seen: {}", job.first_seen);
    println!("Last seen: {}", job.last_seen);
    println!("Updated: {}", job.updated_at);
    if let Some(description) = &r.description {
        println!("\n--- Description ---\n{}", description);
    }
}

fn salary_range(job: &StoredJob) -> String {
    match (job.salary_min_yearly, job.salary_max_yearly) {
        (Some(min), Some(max)) if min == max => format!("${}K", min / 1000),
        (Some(min), Some(max)) => format!("${}-${}K", min / 1000, max / 1000),
        _ => "-".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
