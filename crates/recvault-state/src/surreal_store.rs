//! SurrealDB-backed JobStore and ArtifactRegistry implementation
//!
//! Uses `schema::JobRow`, `schema::ArtifactRow` and `schema::LockRow` for
//! persistence, converting to/from `storage_traits` types at the boundary.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::handle::{self, DbConfig};
use crate::metadata::MetadataEntry;
use crate::schema::{ArtifactRow, JobRow, LockRow};
use crate::storage_traits::{
    ArtifactId, ArtifactRegistry, BackupArtifact, BackupJob, BackupKind, JobCompletion, JobFailure,
    JobFilter, JobId, JobStatus, JobStore, StorageResult,
};

/// How long a lock with no job row is honoured before it is cleared.
const ORPHAN_LOCK_GRACE_SECS: i64 = 60;

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`JobStore`] and [`ArtifactRegistry`].
#[derive(Clone)]
pub struct SurrealBackupStore {
    db: Surreal<Any>,
}

impl SurrealBackupStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect(&DbConfig::in_memory()).await?;
        info!("SurrealBackupStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Connect with explicit settings.
    pub async fn connect(config: &DbConfig) -> crate::Result<Self> {
        let db = handle::connect(config).await?;
        Ok(Self { db })
    }

    /// Connect using [`DbConfig::from_env`].
    pub async fn from_env() -> crate::Result<Self> {
        Self::connect(&DbConfig::from_env()).await
    }

    // -- private helpers -----------------------------------------------------

    /// Fetch a job row by ID, returning the DB row or JobNotFound.
    async fn fetch_job(&self, job_id: &str) -> StorageResult<JobRow> {
        let jid = job_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM backup_jobs WHERE job_id = $jid")
            .bind(("jid", jid))
            .await
            .map_err(backend)?;

        let rows: Vec<JobRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Fetch a job and verify it is still in progress.
    async fn fetch_in_progress(&self, job_id: &str) -> StorageResult<BackupJob> {
        let job = BackupJob::try_from(self.fetch_job(job_id).await?)?;
        if job.status != JobStatus::InProgress {
            return Err(not_in_progress(&job));
        }
        Ok(job)
    }

    async fn insert_job(&self, job: &BackupJob) -> StorageResult<()> {
        let _created: Option<JobRow> = self
            .db
            .create("backup_jobs")
            .content(JobRow::from(job))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_job(&self, job_id: &JobId) -> StorageResult<()> {
        let jid = job_id.0.clone();
        self.db
            .query("DELETE backup_jobs WHERE job_id = $jid")
            .bind(("jid", jid))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    /// Rewrite only the metadata column, leaving status untouched.
    async fn write_metadata(&self, job: &BackupJob) -> StorageResult<()> {
        let jid = job.job_id.0.clone();
        self.db
            .query("UPDATE backup_jobs SET metadata = $metadata WHERE job_id = $jid")
            .bind(("metadata", job.metadata.to_value()))
            .bind(("jid", jid))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    /// Persist a terminal `job` only if the stored row is still in progress.
    ///
    /// The status check and the write are one statement, so of two racing
    /// transitions exactly one lands.
    async fn commit_transition(&self, job: &BackupJob) -> StorageResult<()> {
        let row = JobRow::from(job);
        let jid = job.job_id.0.clone();
        let mut res = self
            .db
            .query(
                "UPDATE backup_jobs CONTENT $row \
                 WHERE job_id = $jid AND status = 'in_progress' RETURN AFTER",
            )
            .bind(("row", row))
            .bind(("jid", jid))
            .await
            .map_err(backend)?;
        let updated: Vec<JobRow> = res.take(0).map_err(backend)?;
        if updated.is_empty() {
            let current = BackupJob::try_from(self.fetch_job(&job.job_id.0).await?)?;
            return Err(not_in_progress(&current));
        }
        Ok(())
    }

    async fn current_lock(&self, kind: BackupKind) -> StorageResult<Option<LockRow>> {
        let lock: Option<LockRow> = self
            .db
            .select(("backup_locks", kind.as_str()))
            .await
            .map_err(backend)?;
        Ok(lock)
    }

    /// Take `backup_locks:<kind>` for `job`. The job row must already exist.
    async fn acquire_lock(&self, kind: BackupKind, job: &BackupJob) -> StorageResult<()> {
        let lock = LockRow {
            kind: kind.as_str().to_string(),
            job_id: job.job_id.0.clone(),
            acquired_at: Utc::now(),
        };

        // Record ids are unique: CREATE fails when the slot is already held.
        for _ in 0..3 {
            let created: Result<Option<LockRow>, surrealdb::Error> = self
                .db
                .create(("backup_locks", kind.as_str()))
                .content(lock.clone())
                .await;
            let err = match created {
                Ok(_) => return Ok(()),
                Err(err) => err,
            };
            debug!(kind = %kind, error = %err, "backup lock create rejected");
            match self.current_lock(kind).await? {
                // Released between our CREATE and SELECT; try again.
                None => continue,
                Some(existing) => {
                    if !self.clear_stale_lock(&existing).await? {
                        return Err(StorageError::JobInProgress {
                            kind: kind.to_string(),
                            job_id: existing.job_id,
                        });
                    }
                }
            }
        }
        Err(StorageError::Backend(format!(
            "could not acquire {kind} backup lock"
        )))
    }

    /// Release the per-kind slot if `job_id` still holds it.
    async fn release_lock(&self, kind: BackupKind, job_id: &JobId) -> StorageResult<()> {
        let kind_owned = kind.as_str().to_string();
        let jid = job_id.0.clone();
        self.db
            .query("DELETE backup_locks WHERE kind = $kind AND job_id = $jid")
            .bind(("kind", kind_owned))
            .bind(("jid", jid))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    /// Drop a lock whose job is no longer in progress (a writer that died
    /// between its terminal write and the release).
    ///
    /// A lock without a job row is held until it is older than
    /// [`ORPHAN_LOCK_GRACE_SECS`]; job rows are written before locks, so
    /// only a row deleted out of band leaves one behind.
    async fn clear_stale_lock(&self, lock: &LockRow) -> StorageResult<bool> {
        let holder = match self.fetch_job(&lock.job_id).await {
            Ok(row) => Some(BackupJob::try_from(row)?),
            Err(StorageError::JobNotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let stale = match holder {
            Some(job) => job.status.is_terminal(),
            None => {
                Utc::now() - lock.acquired_at > Duration::seconds(ORPHAN_LOCK_GRACE_SECS)
            }
        };
        if stale {
            warn!(kind = %lock.kind, job_id = %lock.job_id, "clearing stale backup lock");
            let kind: BackupKind = lock.kind.parse().map_err(StorageError::Backend)?;
            self.release_lock(kind, &JobId(lock.job_id.clone())).await?;
        }
        Ok(stale)
    }
}

fn not_in_progress(job: &BackupJob) -> StorageError {
    StorageError::InvalidJobState {
        job_id: job.job_id.0.clone(),
        status: job.status.to_string(),
        expected: JobStatus::InProgress.to_string(),
    }
}

#[async_trait]
impl JobStore for SurrealBackupStore {
    async fn create_exclusive(&self, kind: BackupKind, quick: bool) -> StorageResult<BackupJob> {
        let job = BackupJob::start(kind, quick);
        debug!(job_id = %job.job_id, kind = %kind, "creating backup job");
        self.insert_job(&job).await?;

        if let Err(err) = self.acquire_lock(kind, &job).await {
            if let Err(cleanup) = self.delete_job(&job.job_id).await {
                warn!(job_id = %job.job_id, error = %cleanup, "could not remove refused job row");
            }
            return Err(err);
        }
        Ok(job)
    }

    async fn insert_terminal(&self, job: BackupJob) -> StorageResult<()> {
        if !job.status.is_terminal() {
            return Err(StorageError::InvalidJobState {
                job_id: job.job_id.0.clone(),
                status: job.status.to_string(),
                expected: "success or failed".to_string(),
            });
        }
        self.insert_job(&job).await
    }

    async fn complete(
        &self,
        job_id: &JobId,
        completion: JobCompletion,
    ) -> StorageResult<BackupJob> {
        let mut job = self.fetch_in_progress(&job_id.0).await?;
        job.apply_completion(completion, Utc::now());
        self.commit_transition(&job).await?;
        self.release_lock(job.backup_kind, job_id).await?;
        Ok(job)
    }

    async fn fail(&self, job_id: &JobId, failure: JobFailure) -> StorageResult<BackupJob> {
        let mut job = self.fetch_in_progress(&job_id.0).await?;
        job.apply_failure(failure, Utc::now());
        self.commit_transition(&job).await?;
        self.release_lock(job.backup_kind, job_id).await?;
        Ok(job)
    }

    async fn annotate(&self, job_id: &JobId, entry: MetadataEntry) -> StorageResult<()> {
        let mut job = BackupJob::try_from(self.fetch_job(&job_id.0).await?)?;
        job.metadata.push(entry);
        self.write_metadata(&job).await
    }

    async fn get(&self, job_id: &JobId) -> StorageResult<BackupJob> {
        BackupJob::try_from(self.fetch_job(&job_id.0).await?)
    }

    async fn list(&self, filter: &JobFilter) -> StorageResult<Vec<BackupJob>> {
        let rows: Vec<JobRow> = if let Some(kind) = filter.kind {
            let kind_owned = kind.as_str().to_string();
            let mut res = self
                .db
                .query("SELECT * FROM backup_jobs WHERE backup_kind = $kind ORDER BY started_at DESC")
                .bind(("kind", kind_owned))
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM backup_jobs ORDER BY started_at DESC")
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        };

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job = BackupJob::try_from(row)?;
            if filter.matches(&job) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn find_by_artifact(
        &self,
        artifact_id: &ArtifactId,
    ) -> StorageResult<Option<BackupJob>> {
        let aid = artifact_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM backup_jobs WHERE artifact_id = $aid ORDER BY started_at ASC")
            .bind(("aid", aid))
            .await
            .map_err(backend)?;
        let rows: Vec<JobRow> = res.take(0).map_err(backend)?;
        rows.into_iter().next().map(BackupJob::try_from).transpose()
    }
}

#[async_trait]
impl ArtifactRegistry for SurrealBackupStore {
    async fn register(&self, artifact: BackupArtifact) -> StorageResult<()> {
        let aid = artifact.artifact_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM backup_artifacts WHERE artifact_id = $aid")
            .bind(("aid", aid))
            .await
            .map_err(backend)?;
        let existing: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        if !existing.is_empty() {
            return Err(StorageError::DuplicateArtifact {
                artifact_id: artifact.artifact_id.0.clone(),
            });
        }

        debug!(artifact_id = %artifact.artifact_id, "registering artifact");
        let _created: Option<ArtifactRow> = self
            .db
            .create("backup_artifacts")
            .content(ArtifactRow::from(&artifact))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn unregister(&self, artifact_id: &ArtifactId) -> StorageResult<()> {
        let aid = artifact_id.0.clone();
        let mut res = self
            .db
            .query("DELETE backup_artifacts WHERE artifact_id = $aid RETURN BEFORE")
            .bind(("aid", aid))
            .await
            .map_err(backend)?;
        let removed: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        if removed.is_empty() {
            return Err(StorageError::ArtifactNotFound {
                artifact_id: artifact_id.0.clone(),
            });
        }
        Ok(())
    }

    async fn get(&self, artifact_id: &ArtifactId) -> StorageResult<BackupArtifact> {
        let aid = artifact_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM backup_artifacts WHERE artifact_id = $aid")
            .bind(("aid", aid))
            .await
            .map_err(backend)?;
        let rows: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::ArtifactNotFound {
                artifact_id: artifact_id.0.clone(),
            })
            .and_then(BackupArtifact::try_from)
    }

    async fn list(&self, kind: Option<BackupKind>) -> StorageResult<Vec<BackupArtifact>> {
        let rows: Vec<ArtifactRow> = if let Some(kind) = kind {
            let kind_owned = kind.as_str().to_string();
            let mut res = self
                .db
                .query(
                    "SELECT * FROM backup_artifacts WHERE backup_kind = $kind ORDER BY created_at DESC",
                )
                .bind(("kind", kind_owned))
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM backup_artifacts ORDER BY created_at DESC")
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        };

        rows.into_iter().map(BackupArtifact::try_from).collect()
    }
}
