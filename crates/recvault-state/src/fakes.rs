//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryJobStore` and `MemoryArtifactRegistry` that satisfy the
//! trait contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::metadata::MetadataEntry;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| StorageError::Backend(format!("lock poisoned: {e}")))
}

fn ensure_in_progress(job: &BackupJob) -> StorageResult<()> {
    if job.status != JobStatus::InProgress {
        return Err(StorageError::InvalidJobState {
            job_id: job.job_id.0.clone(),
            status: job.status.to_string(),
            expected: JobStatus::InProgress.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryJobStore
// ---------------------------------------------------------------------------

/// In-memory job store backed by a `HashMap<JobId, BackupJob>`.
///
/// The whole map sits behind one mutex, which makes the per-kind
/// check-then-insert in `create_exclusive` atomic.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, BackupJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job row as-is, bypassing the state machine.
    ///
    /// Lets tests stage rows such as a job stuck `InProgress` since hours ago.
    pub fn seed(&self, job: BackupJob) -> StorageResult<()> {
        lock(&self.jobs)?.insert(job.job_id.0.clone(), job);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_exclusive(&self, kind: BackupKind, quick: bool) -> StorageResult<BackupJob> {
        let mut jobs = lock(&self.jobs)?;
        if let Some(active) = jobs
            .values()
            .find(|j| j.backup_kind == kind && j.status == JobStatus::InProgress)
        {
            return Err(StorageError::JobInProgress {
                kind: kind.to_string(),
                job_id: active.job_id.0.clone(),
            });
        }
        let job = BackupJob::start(kind, quick);
        jobs.insert(job.job_id.0.clone(), job.clone());
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
        lock(&self.jobs)?.insert(job.job_id.0.clone(), job);
        Ok(())
    }

    async fn complete(
        &self,
        job_id: &JobId,
        completion: JobCompletion,
    ) -> StorageResult<BackupJob> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs
            .get_mut(&job_id.0)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        ensure_in_progress(job)?;
        job.apply_completion(completion, Utc::now());
        Ok(job.clone())
    }

    async fn fail(&self, job_id: &JobId, failure: JobFailure) -> StorageResult<BackupJob> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs
            .get_mut(&job_id.0)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        ensure_in_progress(job)?;
        job.apply_failure(failure, Utc::now());
        Ok(job.clone())
    }

    async fn annotate(&self, job_id: &JobId, entry: MetadataEntry) -> StorageResult<()> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs
            .get_mut(&job_id.0)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        job.metadata.push(entry);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> StorageResult<BackupJob> {
        let jobs = lock(&self.jobs)?;
        jobs.get(&job_id.0)
            .cloned()
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })
    }

    async fn list(&self, filter: &JobFilter) -> StorageResult<Vec<BackupJob>> {
        let jobs = lock(&self.jobs)?;
        let mut matching: Vec<BackupJob> =
            jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(matching)
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactRegistry
// ---------------------------------------------------------------------------

/// In-memory artifact registry backed by a `HashMap<ArtifactId, BackupArtifact>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactRegistry {
    artifacts: Mutex<HashMap<String, BackupArtifact>>,
}

impl MemoryArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactRegistry for MemoryArtifactRegistry {
    async fn register(&self, artifact: BackupArtifact) -> StorageResult<()> {
        let mut artifacts = lock(&self.artifacts)?;
        if artifacts.contains_key(&artifact.artifact_id.0) {
            return Err(StorageError::DuplicateArtifact {
                artifact_id: artifact.artifact_id.0.clone(),
            });
        }
        artifacts.insert(artifact.artifact_id.0.clone(), artifact);
        Ok(())
    }

    async fn unregister(&self, artifact_id: &ArtifactId) -> StorageResult<()> {
        let mut artifacts = lock(&self.artifacts)?;
        artifacts
            .remove(&artifact_id.0)
            .map(|_| ())
            .ok_or_else(|| StorageError::ArtifactNotFound {
                artifact_id: artifact_id.0.clone(),
            })
    }

    async fn get(&self, artifact_id: &ArtifactId) -> StorageResult<BackupArtifact> {
        let artifacts = lock(&self.artifacts)?;
        artifacts
            .get(&artifact_id.0)
            .cloned()
            .ok_or_else(|| StorageError::ArtifactNotFound {
                artifact_id: artifact_id.0.clone(),
            })
    }

    async fn list(&self, kind: Option<BackupKind>) -> StorageResult<Vec<BackupArtifact>> {
        let artifacts = lock(&self.artifacts)?;
        let mut matching: Vec<BackupArtifact> = artifacts
            .values()
            .filter(|a| kind.map(|k| a.backup_kind == k).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }
}
