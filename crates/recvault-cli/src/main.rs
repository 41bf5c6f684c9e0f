//! recvault - backup, verify and restore for a records application
//!
//! ## Commands
//!
//! - `create`: Enqueue and run a backup job
//! - `execute`: Run a previously enqueued job
//! - `cleanup`: Fail jobs stuck in progress
//! - `verify`: Re-digest an artifact and compare checksums
//! - `monitor`: Compute backup health and raise alerts
//! - `upload`: Ingest an externally produced records file
//! - `restore`: Preview or execute a restore
//! - `jobs` / `artifacts`: List persisted rows

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recvault_core::{
    ArtifactId, ArtifactRegistry, BackupKind, Catalog, FsRecordStore, JobId, JobStatus, JobStore,
    RestoreMode, RestoreOptions, RestoreStatus, RestoreStrategy, TypeOutcome, Vault, VaultConfig,
};
use recvault_state::{JobFilter, SurrealBackupStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "recvault")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Snapshot, verify and restore application records and media", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON results
    #[arg(long, global = true)]
    json: bool,

    /// Entity type catalog (JSON)
    #[arg(long, global = true, env = "RECVAULT_CATALOG", default_value = ".recvault/catalog.json")]
    catalog: PathBuf,

    /// Live record store directory
    #[arg(long, global = true, env = "RECVAULT_DATA_DIR", default_value = ".recvault/data")]
    data_dir: PathBuf,

    /// Artifact directory (overrides RECVAULT_BACKUP_DIR)
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    /// Live media directory (overrides RECVAULT_MEDIA_DIR)
    #[arg(long, global = true)]
    media_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue and run a backup
    Create {
        /// database | media | full
        #[arg(short, long, default_value = "database")]
        kind: BackupKind,

        /// Skip optional entity types and use the short time budget
        #[arg(long)]
        quick: bool,

        /// Verify the artifact checksum after writing
        #[arg(long)]
        verify: bool,
    },

    /// Run a job created earlier (for example by another process)
    Execute {
        /// Job ID
        job_id: String,
    },

    /// Force jobs stuck in progress to failed
    Cleanup {
        /// Age in minutes after which an in-progress job counts as stuck
        #[arg(long)]
        timeout_minutes: Option<u64>,

        /// Only list what would be cleaned up
        #[arg(long)]
        dry_run: bool,
    },

    /// Recompute an artifact's checksum
    Verify {
        /// Artifact ID
        artifact_id: String,
    },

    /// Compute backup health and optionally deliver alerts
    Monitor {
        /// Deliver open alerts to the log and webhook sinks
        #[arg(long)]
        send_alerts: bool,

        /// Confirm recent artifacts still exist on disk
        #[arg(long)]
        check_external: bool,

        /// Scoring window
        #[arg(long, default_value = "24")]
        window_hours: u64,
    },

    /// Validate and register an externally produced records file (plain or gzip)
    Upload {
        /// Records file
        file: PathBuf,

        /// Kind the file claims to be
        #[arg(short, long, default_value = "database")]
        kind: BackupKind,

        /// Free-form description stored with the artifact
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Restore an artifact (preview unless --execute)
    Restore {
        /// Artifact ID
        artifact_id: String,

        /// replace | merge
        #[arg(short, long, default_value = "merge")]
        strategy: RestoreStrategy,

        /// Apply changes instead of previewing
        #[arg(long)]
        execute: bool,

        /// Abort before writing if any reference is unresolved
        #[arg(long)]
        strict: bool,
    },

    /// List backup jobs
    Jobs {
        /// Filter by kind
        #[arg(short, long)]
        kind: Option<BackupKind>,

        /// Only jobs still in progress
        #[arg(long)]
        running: bool,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List registered artifacts
    Artifacts {
        /// Filter by kind
        #[arg(short, long)]
        kind: Option<BackupKind>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    recvault_core::init_tracing(cli.json, level);

    let mut config = VaultConfig::from_env().context("Invalid RECVAULT_* configuration")?;
    if let Some(dir) = cli.backup_dir {
        config = config.with_backup_root(dir);
    }
    if let Some(dir) = cli.media_dir {
        config = config.with_media_root(dir);
    }

    // Initialize database connection
    let state = Arc::new(
        SurrealBackupStore::from_env()
            .await
            .context("Failed to connect to recvault database")?,
    );
    let catalog = Catalog::load(&cli.catalog)
        .with_context(|| format!("Failed to load catalog {}", cli.catalog.display()))?;
    let store = Arc::new(
        FsRecordStore::new(&cli.data_dir)
            .with_context(|| format!("Failed to open record store {}", cli.data_dir.display()))?,
    );
    let vault = Vault::new(state.clone(), state.clone(), store, catalog, config.clone());
    let out = Output { json: cli.json };

    let result = match cli.command {
        Commands::Create {
            kind,
            quick,
            verify,
        } => cmd_create(&vault, out, kind, quick, verify).await,
        Commands::Execute { job_id } => cmd_execute(&vault, out, &job_id).await,
        Commands::Cleanup {
            timeout_minutes,
            dry_run,
        } => {
            let minutes = timeout_minutes.unwrap_or(config.stuck_threshold_minutes);
            cmd_cleanup(&vault, out, minutes, dry_run).await
        }
        Commands::Verify { artifact_id } => cmd_verify(&vault, out, &artifact_id).await,
        Commands::Monitor {
            send_alerts,
            check_external,
            window_hours,
        } => cmd_monitor(&vault, &config, out, send_alerts, check_external, window_hours).await,
        Commands::Upload {
            file,
            kind,
            description,
        } => cmd_upload(&vault, out, &file, kind, description).await,
        Commands::Restore {
            artifact_id,
            strategy,
            execute,
            strict,
        } => cmd_restore(&vault, out, &artifact_id, strategy, execute, strict).await,
        Commands::Jobs {
            kind,
            running,
            limit,
        } => cmd_jobs(state.as_ref(), out, kind, running, limit).await,
        Commands::Artifacts { kind } => cmd_artifacts(state.as_ref(), out, kind).await,
    };

    recvault_core::METRICS.flush();
    result
}

/// Result printing: pretty JSON with `--json`, text otherwise.
#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text();
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct BackupSummary<'a> {
    job: &'a recvault_core::BackupJob,
    artifact: Option<&'a recvault_core::BackupArtifact>,
    verification: Option<&'a recvault_core::VerificationReport>,
}

fn print_outcome(out: Output, outcome: &recvault_core::BackupOutcome) -> Result<()> {
    let summary = BackupSummary {
        job: &outcome.job,
        artifact: outcome.artifact.as_ref(),
        verification: outcome.verification.as_ref(),
    };
    out.emit(&summary, || {
        let job = &outcome.job;
        println!("job {} [{}] {}", job.job_id, job.backup_kind, job.status);
        if let Some(secs) = job.duration_seconds {
            println!("  duration: {secs:.1}s");
        }
        if let Some(artifact) = &outcome.artifact {
            println!("  artifact: {}", artifact.artifact_id);
            println!("  location: {}", artifact.location.display());
            println!(
                "  records:  {}  files: {}  bytes: {}",
                artifact.total_records, artifact.total_files, artifact.byte_size
            );
            println!("  checksum: {}", artifact.checksum);
            if artifact.partial {
                println!("  partial:  yes");
            }
        }
        if let Some(report) = &outcome.verification {
            println!(
                "  verified: {}",
                if report.passed { "ok" } else { "MISMATCH" }
            );
        }
        if let Some(err) = &job.error_message {
            println!("  error:    {err}");
        }
    })
}

async fn cmd_create(
    vault: &Vault,
    out: Output,
    kind: BackupKind,
    quick: bool,
    verify: bool,
) -> Result<()> {
    let outcome = vault
        .orchestrator
        .create_backup(kind, quick, verify)
        .await
        .context("Backup could not be started")?;
    print_outcome(out, &outcome)?;
    if !outcome.succeeded() {
        bail!("backup job {} failed", outcome.job.job_id);
    }
    Ok(())
}

async fn cmd_execute(vault: &Vault, out: Output, job_id: &str) -> Result<()> {
    let outcome = vault
        .orchestrator
        .execute(&JobId(job_id.to_string()))
        .await
        .with_context(|| format!("Failed to execute job {job_id}"))?;
    print_outcome(out, &outcome)?;
    if !outcome.succeeded() {
        bail!("backup job {job_id} failed");
    }
    Ok(())
}

async fn cmd_cleanup(vault: &Vault, out: Output, minutes: u64, dry_run: bool) -> Result<()> {
    let report = vault.orchestrator.cleanup_stuck(minutes, dry_run).await?;
    out.emit(&report, || {
        let verb = if dry_run { "would fail" } else { "failed" };
        println!(
            "scanned {} in-progress job(s); {verb} {} (threshold {minutes} min)",
            report.scanned,
            report.affected.len()
        );
        for job in &report.affected {
            println!(
                "  {} [{}] started {} ({:.1} min)",
                job.job_id,
                job.backup_kind,
                job.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                job.elapsed_seconds / 60.0
            );
        }
    })
}

async fn cmd_verify(vault: &Vault, out: Output, artifact_id: &str) -> Result<()> {
    let report = vault
        .orchestrator
        .verify(&ArtifactId(artifact_id.to_string()))
        .await
        .with_context(|| format!("Failed to verify artifact {artifact_id}"))?;
    out.emit(&report, || {
        println!("artifact {}", report.artifact_id);
        println!("  expected: {}", report.expected);
        println!("  actual:   {}", report.actual);
        if let Some(err) = &report.error {
            println!("  error:    {err}");
        }
        println!("  result:   {}", if report.passed { "ok" } else { "MISMATCH" });
    })?;
    if let Some(err) = report.integrity_error() {
        return Err(err.into());
    }
    Ok(())
}

fn monitor_window(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

async fn cmd_monitor(
    vault: &Vault,
    config: &VaultConfig,
    out: Output,
    send_alerts: bool,
    check_external: bool,
    window_hours: u64,
) -> Result<()> {
    let sinks = Vault::alert_sinks(config)?;
    let report = vault
        .health
        .monitor(
            monitor_window(window_hours),
            send_alerts,
            check_external,
            &sinks,
        )
        .await?;
    let snapshot = &report.snapshot;
    out.emit(&report, || {
        println!(
            "health score {:.2} over {}h: {} ok, {} failed, {} running",
            snapshot.score,
            snapshot.window_hours,
            snapshot.successes,
            snapshot.failures,
            snapshot.in_progress
        );
        match snapshot.last_successful_database_backup {
            Some(at) => println!("last database backup: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
            None => println!("last database backup: never"),
        }
        if check_external {
            println!("artifacts checked on disk: {}", report.artifacts_checked);
        }
        if snapshot.open_alerts.is_empty() {
            println!("no open alerts");
        }
        for alert in &snapshot.open_alerts {
            println!(
                "  [{}] {}: {}",
                alert.severity.as_str(),
                alert.kind.as_str(),
                alert.message
            );
        }
        for err in &report.delivery_errors {
            println!("  delivery failed: {err}");
        }
    })?;
    if snapshot.has_critical() {
        bail!("backup health is critical");
    }
    Ok(())
}

async fn cmd_upload(
    vault: &Vault,
    out: Output,
    file: &Path,
    kind: BackupKind,
    description: Option<String>,
) -> Result<()> {
    let artifact = vault
        .uploads
        .upload_file(file, kind, description)
        .await
        .with_context(|| format!("Upload of {} rejected", file.display()))?;
    out.emit(&artifact, || {
        println!("artifact {} [{}] registered", artifact.artifact_id, artifact.backup_kind);
        println!("  records:  {}", artifact.total_records);
        println!("  checksum: {}", artifact.checksum);
    })
}

async fn cmd_restore(
    vault: &Vault,
    out: Output,
    artifact_id: &str,
    strategy: RestoreStrategy,
    execute: bool,
    strict: bool,
) -> Result<()> {
    let mode = if execute {
        RestoreMode::Execute
    } else {
        RestoreMode::Preview
    };
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current type");
            flag.store(true, Ordering::SeqCst);
        }
    });
    let options = RestoreOptions {
        strict,
        cancel: Some(cancel),
    };

    let report = vault
        .restores
        .restore(&ArtifactId(artifact_id.to_string()), strategy, mode, options)
        .await
        .with_context(|| format!("Restore of {artifact_id} refused"))?;
    info!(attempt_id = %report.attempt_id, status = report.status.as_str(), "restore done");

    out.emit(&report, || {
        println!(
            "restore {} of {} ({} / {}): {}",
            report.attempt_id,
            report.artifact_id,
            report.strategy,
            report.mode.as_str(),
            report.status.as_str()
        );
        for t in &report.types {
            let outcome = match &t.outcome {
                TypeOutcome::Planned => "planned".to_string(),
                TypeOutcome::Committed {
                    inserted,
                    updated,
                    deleted,
                } => format!("+{inserted} ~{updated} -{deleted}"),
                TypeOutcome::Failed { error } => format!("failed: {error}"),
                TypeOutcome::SkippedDependencyFailed { dependency } => {
                    format!("skipped ({dependency} failed)")
                }
                TypeOutcome::Cancelled => "cancelled".to_string(),
            };
            println!(
                "  {:<24} {:>8} records  {:>8} planned  {outcome}",
                t.type_name, t.records, t.planned
            );
        }
        for (type_name, n) in &report.unknown_types {
            println!("  {type_name:<24} {n:>8} records  (unknown type, skipped)");
        }
        for conflict in &report.conflicts {
            println!("  conflict: {conflict}");
        }
        if let Some(media) = &report.media {
            println!(
                "  media: {} file(s), {} skipped",
                media.files, media.skipped_existing
            );
        }
        if let Some(err) = &report.error {
            println!("  error: {err}");
        }
    })?;

    match report.status {
        RestoreStatus::Previewed | RestoreStatus::Completed => Ok(()),
        other => bail!("restore finished with status {}", other.as_str()),
    }
}

async fn cmd_jobs(
    jobs: &dyn JobStore,
    out: Output,
    kind: Option<BackupKind>,
    running: bool,
    limit: usize,
) -> Result<()> {
    let mut filter = JobFilter::all();
    filter.kind = kind;
    if running {
        filter.status = Some(JobStatus::InProgress);
    }
    let mut rows = jobs.list(&filter).await?;
    rows.truncate(limit);

    out.emit(&rows, || {
        if rows.is_empty() {
            println!("No jobs found");
            return;
        }
        for job in &rows {
            let duration = job
                .duration_seconds
                .map(|d| format!("{d:.1}s"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{}  {:<8} {:<11} {}  {:>8}  {}",
                job.job_id,
                job.backup_kind.as_str(),
                job.status.as_str(),
                job.started_at.format("%Y-%m-%d %H:%M:%S"),
                duration,
                job.error_message.as_deref().unwrap_or("")
            );
        }
    })
}

async fn cmd_artifacts(
    artifacts: &dyn ArtifactRegistry,
    out: Output,
    kind: Option<BackupKind>,
) -> Result<()> {
    let rows = artifacts.list(kind).await?;
    out.emit(&rows, || {
        if rows.is_empty() {
            println!("No artifacts found");
            return;
        }
        for a in &rows {
            println!(
                "{}  {:<8} {:<8} {:>8} records {:>10} bytes{}  {}",
                a.artifact_id,
                a.backup_kind.as_str(),
                a.source.as_str(),
                a.total_records,
                a.byte_size,
                if a.partial { " (partial)" } else { "" },
                a.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    })
}
