//! CLI command definitions for gridjobs.
//!
//! `run` submits the jobs listed in a YAML manifest and waits for them;
//! `status` prints the records of a database kept from an earlier run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ManagerConfig;
use crate::error::JobError;
use crate::scheduler::{Job, JobManager, JobStatus, SchedulerKind, WaitReport};
use crate::storage::{JobRecord, JobRecordStore, SqliteJobStore};

/// Submit shell jobs to a cluster batch scheduler and wait for them.
#[derive(Parser)]
#[command(name = "gridjobs")]
#[command(about = "Submit job groups to a batch scheduler and wait for them to finish")]
#[command(version)]
#[command(
    long_about = "gridjobs submits groups of shell jobs to a cluster batch scheduler (SGE) and blocks until every job has finished.\n\nA job succeeds only if the last line of its output is the completion marker printed by the generated wrapper.\n\nExample usage:\n  gridjobs run jobs.yaml --keep-db\n  gridjobs status ./myproject_ab12cd34.db --group align"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit every job of a manifest and wait for all groups to finish.
    Run(RunArgs),

    /// Show the job records of a kept database.
    Status(StatusArgs),
}

/// Arguments for `gridjobs run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML manifest describing the job groups.
    pub manifest: PathBuf,

    /// Keep the job record database after the run.
    #[arg(long, env = "GRIDJOBS_KEEP_DB")]
    pub keep_db: bool,

    /// Only report progress at debug level.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for `gridjobs status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job record database written by `gridjobs run --keep-db`.
    pub database: PathBuf,

    /// Only show jobs of this group.
    #[arg(short, long)]
    pub group: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Job groups to submit, as read from a manifest file.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub project: String,
    #[serde(default)]
    pub scheduler: Option<String>,
    pub groups: Vec<GroupManifest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupManifest {
    pub id: String,
    pub queue: String,
    #[serde(default)]
    pub resources: Vec<String>,
    pub jobs: Vec<JobManifest>,
}

/// One job entry; exactly one of `command` and `script` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct JobManifest {
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub wrapper: Option<PathBuf>,
}

impl JobManifest {
    fn to_job(&self) -> Job {
        let mut job = Job::new(self.name.clone());
        if let Some(command) = &self.command {
            job = job.with_command(command.clone());
        }
        if let Some(script) = &self.script {
            job = job.with_script(script.clone());
        }
        if let Some(dir) = &self.dir {
            job = job.with_working_dir(dir.clone());
        }
        if let Some(wrapper) = &self.wrapper {
            job = job.with_wrapper_path(wrapper.clone());
        }
        job
    }
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_jobs_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_jobs_command(args: RunArgs) -> anyhow::Result<()> {
    let manifest = load_manifest(&args.manifest)?;

    let mut config = ManagerConfig::from_env()?
        .with_project_id(manifest.project.clone())
        .with_keep_database(args.keep_db);
    if let Some(tag) = &manifest.scheduler {
        config = config.with_scheduler(tag.parse::<SchedulerKind>()?);
    }

    let mut manager = JobManager::new(config).await?;

    let cancel = manager.cancel_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping wait loops (submitted jobs keep running)");
            cancel.cancel();
        }
    });

    let result = submit_and_wait(&mut manager, &manifest, !args.quiet).await;
    ctrl_c.abort();
    if let Err(e) = &result {
        if e.is_job_failure() {
            warn!("Stopped polling the remaining groups; their submitted jobs keep running");
        }
    }

    print_summary(&manager);
    if let Some(path) = manager.database_path().filter(|_| args.keep_db) {
        println!("  Records kept in: {}", path.display());
    }

    // Release the store even when submission or waiting failed.
    let shutdown = manager.shutdown().await;
    let reports = result?;
    shutdown?;

    info!(groups = reports.len(), "All job groups finished");
    Ok(())
}

async fn submit_and_wait(
    manager: &mut JobManager,
    manifest: &Manifest,
    verbose: bool,
) -> Result<Vec<(String, WaitReport)>, JobError> {
    for group in &manifest.groups {
        manager
            .create_group(&group.id, &group.queue, group.resources.clone())
            .await?;
        for job in &group.jobs {
            manager.insert_job(&group.id, job.to_job())?;
        }
    }

    for group in &manifest.groups {
        manager.submit(&group.id, None).await?;
    }

    manager.wait_all(verbose).await
}

fn load_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let content = fs::read_to_string(path).map_err(|e| {
        anyhow::anyhow!("Failed to read manifest {}: {}", path.display(), e)
    })?;
    parse_manifest(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse manifest {}: {}", path.display(), e))
}

fn parse_manifest(content: &str) -> anyhow::Result<Manifest> {
    let manifest: Manifest = serde_yaml::from_str(content)?;
    if manifest.groups.is_empty() {
        anyhow::bail!("manifest lists no job groups");
    }
    Ok(manifest)
}

fn print_summary(manager: &JobManager) {
    println!("\n=== Job Groups ===");
    for group in manager.groups() {
        println!(
            "{:<20} queue={:<12} jobs={:<4} success={:<4} error={:<4} waiting={:<4} pending={}",
            group.id(),
            group.queue(),
            group.len(),
            group.count(JobStatus::Success),
            group.count(JobStatus::Error),
            group.count(JobStatus::Waiting),
            group.count(JobStatus::Pending),
        );
    }
}

// ============================================================================
// Status Command Implementation
// ============================================================================

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    if !args.database.exists() {
        anyhow::bail!("Database not found: {}", args.database.display());
    }

    let store = SqliteJobStore::open(&args.database).await?;
    let records = match &args.group {
        Some(group) => store.list_group(group).await?,
        None => store.list_all().await?,
    };
    store.close().await?;

    if args.json {
        let json_output = serde_json::to_string_pretty(&records)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
        return Ok(());
    }

    if records.is_empty() {
        println!("No job records in {}", args.database.display());
        return Ok(());
    }

    for record in &records {
        println!(
            "{:<10} {:<16} {:<24} {:<8} {}",
            record.scheduler_job_id,
            record.group_id,
            record.job_name,
            record.status,
            record.submitted_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    println!();
    for (status, count) in status_counts(&records) {
        println!("  {}: {}", status, count);
    }
    Ok(())
}

fn status_counts(records: &[JobRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.status.to_string()).or_insert(0) += 1;
    }
    counts
}
