//! Backup orchestrator: job lifecycle around the snapshot writer.
//!
//! `enqueue` claims the per-kind slot and persists an `in_progress` row
//! before any work starts. `execute` runs the writer under the cooperative
//! deadline plus a hard outer timeout, then drives the row to exactly one
//! terminal state. `cleanup_stuck` is the only path that fails a job this
//! process did not start.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recvault_state::{
    ArtifactId, ArtifactRegistry, BackupArtifact, BackupJob, BackupKind, JobCompletion,
    JobFailure, JobFilter, JobId, JobStatus, JobStore, MetadataEntry, SourceFailure,
    StorageError, VerificationInfo,
};
use serde::Serialize;
use tracing::{debug, info, warn, Instrument};

use crate::artifact;
use crate::error::{IntegrityError, VaultError, VaultResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::snapshot::{
    discard_dir, Deadline, SnapshotError, SnapshotOutcome, SnapshotRequest, SnapshotWriter,
};
use crate::VaultConfig;

/// Result of running one job.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub job: BackupJob,
    pub artifact: Option<BackupArtifact>,
    pub verification: Option<VerificationReport>,
}

impl BackupOutcome {
    pub fn succeeded(&self) -> bool {
        self.job.status == JobStatus::Success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub artifact_id: String,
    pub job_id: Option<String>,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    pub verified_at: DateTime<Utc>,
    /// Files could not be read at all.
    pub error: Option<String>,
}

impl VerificationReport {
    pub fn integrity_error(&self) -> Option<IntegrityError> {
        (!self.passed).then(|| IntegrityError {
            artifact_id: self.artifact_id.clone(),
            expected: self.expected.clone(),
            actual: self.actual.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckJob {
    pub job_id: String,
    pub backup_kind: BackupKind,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub threshold_minutes: u64,
    pub dry_run: bool,
    /// In-progress jobs inspected.
    pub scanned: usize,
    /// Jobs past the threshold (failed, or would be on a dry run).
    pub affected: Vec<StuckJob>,
}

pub struct BackupOrchestrator {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactRegistry>,
    writer: SnapshotWriter,
    config: VaultConfig,
}

impl BackupOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactRegistry>,
        writer: SnapshotWriter,
        config: VaultConfig,
    ) -> Self {
        Self {
            jobs,
            artifacts,
            writer,
            config,
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Persist a new `in_progress` job. Fails with `JobInProgress` when
    /// another job of the same kind holds the slot.
    pub async fn enqueue(&self, kind: BackupKind, quick: bool) -> VaultResult<BackupJob> {
        let job = self.jobs.create_exclusive(kind, quick).await?;
        debug!(job_id = %job.job_id, kind = %kind, quick, "backup job enqueued");
        Ok(job)
    }

    /// Run a previously enqueued job to a terminal state.
    pub async fn execute(&self, job_id: &JobId) -> VaultResult<BackupOutcome> {
        let job = self.jobs.get(job_id).await?;
        if job.status != JobStatus::InProgress {
            return Err(VaultError::JobNotRunnable {
                job_id: job_id.0.clone(),
                status: job.status.to_string(),
            });
        }
        let span = obs::job_span(&job.job_id.0, job.backup_kind.as_str());
        self.run(job).instrument(span).await
    }

    async fn run(&self, job: BackupJob) -> VaultResult<BackupOutcome> {
        let budget = self.config.budget_for(job.quick);
        let deadline = Deadline::new(budget);
        let request = SnapshotRequest {
            artifact_id: ArtifactId::new(),
            kind: job.backup_kind,
            quick: job.quick,
            description: None,
        };
        obs::emit_backup_started(&job.job_id.0, job.backup_kind.as_str(), job.quick);

        let hard_limit = budget + self.config.timeout_grace;
        let written = tokio::time::timeout(
            hard_limit,
            self.writer
                .write(&self.config.backup_root, &request, deadline),
        )
        .await;
        let result = match written {
            Ok(result) => result,
            Err(_) => {
                discard_dir(&self.config.artifact_dir(&request.artifact_id.0));
                Err(SnapshotError::Timeout {
                    elapsed_seconds: deadline.elapsed().as_secs_f64(),
                    budget_seconds: budget.as_secs(),
                })
            }
        };

        match result {
            Ok(outcome) => self.finish_success(job, outcome).await,
            Err(e) => self.finish_failure(job, e).await,
        }
    }

    async fn finish_success(
        &self,
        job: BackupJob,
        outcome: SnapshotOutcome,
    ) -> VaultResult<BackupOutcome> {
        let artifact = outcome.artifact;
        if let Err(e) = self.artifacts.register(artifact.clone()).await {
            discard_dir(&artifact.location);
            return self
                .finish_failure_message(job, format!("artifact registration failed: {e}"), vec![])
                .await;
        }

        let mut metadata = Vec::new();
        if job.quick {
            metadata.push(MetadataEntry::QuickBackup {
                skipped_types: outcome.skipped_types,
            });
        }
        if !outcome.failures.is_empty() {
            metadata.push(MetadataEntry::SourceErrors {
                failures: outcome
                    .failures
                    .into_iter()
                    .map(|f| SourceFailure {
                        type_name: f.type_name,
                        error: f.reason,
                    })
                    .collect(),
            });
        }

        let completion = JobCompletion {
            artifact_id: artifact.artifact_id.clone(),
            byte_size: artifact.byte_size,
            checksum: artifact.checksum.clone(),
            metadata,
        };
        let done = match self.jobs.complete(&job.job_id, completion).await {
            Ok(done) => done,
            Err(e) => {
                // The row was finished elsewhere (sweep or a second executor):
                // this artifact belongs to no successful job.
                warn!(job_id = %job.job_id, error = %e, "job no longer in progress; withdrawing artifact");
                withdraw(self.artifacts.as_ref(), &artifact).await;
                return Err(e.into());
            }
        };

        METRICS.inc_backups_succeeded();
        obs::emit_backup_finished(
            &done.job_id.0,
            done.backup_kind.as_str(),
            artifact.total_records,
            artifact.byte_size,
            done.duration_seconds.unwrap_or_default(),
        );
        Ok(BackupOutcome {
            job: done,
            artifact: Some(artifact),
            verification: None,
        })
    }

    async fn finish_failure(
        &self,
        job: BackupJob,
        error: SnapshotError,
    ) -> VaultResult<BackupOutcome> {
        match error {
            SnapshotError::Timeout {
                elapsed_seconds,
                budget_seconds,
            } => {
                let message = format!(
                    "backup timed out after {elapsed_seconds:.1}s (budget {budget_seconds}s)"
                );
                let entry = MetadataEntry::Timeout {
                    elapsed_seconds,
                    budget_seconds,
                };
                self.finish_failure_message(job, message, vec![entry]).await
            }
            other => {
                self.finish_failure_message(job, other.to_string(), vec![])
                    .await
            }
        }
    }

    async fn finish_failure_message(
        &self,
        job: BackupJob,
        message: String,
        entries: Vec<MetadataEntry>,
    ) -> VaultResult<BackupOutcome> {
        obs::emit_backup_failed(&job.job_id.0, job.backup_kind.as_str(), &message);
        let failure = JobFailure {
            error_message: message,
            metadata: entries,
        };
        let failed = self.jobs.fail(&job.job_id, failure).await?;
        METRICS.inc_backups_failed();
        Ok(BackupOutcome {
            job: failed,
            artifact: None,
            verification: None,
        })
    }

    /// Enqueue, execute and optionally verify in one call.
    pub async fn create_backup(
        &self,
        kind: BackupKind,
        quick: bool,
        verify: bool,
    ) -> VaultResult<BackupOutcome> {
        let job = self.enqueue(kind, quick).await?;
        let mut outcome = self.execute(&job.job_id).await?;
        if verify {
            if let Some(artifact) = &outcome.artifact {
                let report = self.verify(&artifact.artifact_id).await?;
                outcome.job = self.jobs.get(&job.job_id).await?;
                outcome.verification = Some(report);
            }
        }
        Ok(outcome)
    }

    /// Recompute an artifact's checksum and record the result on the job
    /// that produced it. A mismatch is reported, never auto-deleted.
    pub async fn verify(&self, artifact_id: &ArtifactId) -> VaultResult<VerificationReport> {
        let artifact = self.artifacts.get(artifact_id).await?;
        let check = tokio::task::spawn_blocking(move || artifact::check(&artifact)).await?;
        let verified_at = Utc::now();

        let job = self.jobs.find_by_artifact(artifact_id).await?;
        if let Some(job) = &job {
            self.jobs
                .annotate(
                    &job.job_id,
                    MetadataEntry::Verification(VerificationInfo {
                        verified_at,
                        passed: check.passed,
                        expected: check.expected.clone(),
                        actual: check.actual.clone(),
                    }),
                )
                .await?;
        }

        obs::emit_verification(&artifact_id.0, check.passed);
        Ok(VerificationReport {
            artifact_id: artifact_id.0.clone(),
            job_id: job.map(|j| j.job_id.0),
            expected: check.expected,
            actual: check.actual,
            passed: check.passed,
            verified_at,
            error: check.error,
        })
    }

    /// Force `in_progress` jobs older than `threshold_minutes` to failed.
    /// Running it twice in a row changes nothing the second time.
    pub async fn cleanup_stuck(
        &self,
        threshold_minutes: u64,
        dry_run: bool,
    ) -> VaultResult<CleanupReport> {
        let now = Utc::now();
        let threshold_seconds = threshold_minutes as f64 * 60.0;
        let candidates = self.jobs.list(&JobFilter::in_progress()).await?;
        let scanned = candidates.len();
        let mut affected = Vec::new();

        for job in candidates {
            let elapsed = job.elapsed_seconds(now);
            if elapsed < threshold_seconds {
                continue;
            }
            obs::emit_stuck_job(&job.job_id.0, job.backup_kind.as_str(), elapsed, dry_run);
            let stuck = StuckJob {
                job_id: job.job_id.0.clone(),
                backup_kind: job.backup_kind,
                started_at: job.started_at,
                elapsed_seconds: elapsed,
            };
            if dry_run {
                affected.push(stuck);
                continue;
            }

            let failure = JobFailure::new(format!(
                "stuck job cleaned up after {:.1} minutes (threshold {threshold_minutes} minutes)",
                elapsed / 60.0
            ))
            .with_entry(MetadataEntry::StuckCleanup {
                elapsed_seconds: elapsed,
                threshold_minutes,
            });
            match self.jobs.fail(&job.job_id, failure).await {
                Ok(_) => {
                    METRICS.inc_backups_failed();
                    affected.push(stuck);
                }
                Err(StorageError::InvalidJobState { .. }) => {
                    debug!(job_id = %job.job_id, "job finished before cleanup reached it");
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            event = "cleanup.finished",
            scanned,
            affected = affected.len(),
            dry_run,
            "stuck job sweep complete"
        );
        Ok(CleanupReport {
            threshold_minutes,
            dry_run,
            scanned,
            affected,
        })
    }
}

/// Undo a registration whose job could not be completed and drop its files.
pub(crate) async fn withdraw(artifacts: &dyn ArtifactRegistry, artifact: &BackupArtifact) {
    if let Err(e) = artifacts.unregister(&artifact.artifact_id).await {
        warn!(artifact_id = %artifact.artifact_id, error = %e, "could not unregister artifact");
    }
    discard_dir(&artifact.location);
}

