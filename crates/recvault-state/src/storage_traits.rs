//! Storage trait definitions for recvault
//!
//! These traits define the persisted state of the backup engine:
//! - `JobStore`: lifecycle rows for backup attempts (`BackupJob`)
//! - `ArtifactRegistry`: finalized, immutable artifacts (`BackupArtifact`)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module; `SurrealBackupStore` persists both.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::metadata::{JobMetadata, MetadataEntry};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers and enums
// ---------------------------------------------------------------------------

/// Unique identifier for a backup job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random JobId
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a backup artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    /// Generate a new random ArtifactId
    pub fn new() -> Self {
        ArtifactId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a backup covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Relational records only.
    Database,
    /// Media asset tree only.
    Media,
    /// Records and media.
    Full,
}

impl BackupKind {
    pub const ALL: [BackupKind; 3] = [BackupKind::Database, BackupKind::Media, BackupKind::Full];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Database => "database",
            BackupKind::Media => "media",
            BackupKind::Full => "full",
        }
    }

    /// Whether artifacts of this kind contain serialized records.
    pub fn includes_records(&self) -> bool {
        matches!(self, BackupKind::Database | BackupKind::Full)
    }

    /// Whether artifacts of this kind contain a media tree.
    pub fn includes_media(&self) -> bool {
        matches!(self, BackupKind::Media | BackupKind::Full)
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(BackupKind::Database),
            "media" => Ok(BackupKind::Media),
            "full" => Ok(BackupKind::Full),
            other => Err(format!("unknown backup kind: {other}")),
        }
    }
}

/// Status of a backup job.
///
/// Transitions: `InProgress → Success | Failed`. Both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "in_progress",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(JobStatus::InProgress),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Where an artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Produced by the snapshot writer.
    Created,
    /// Ingested through the upload gateway.
    Uploaded,
}

impl ArtifactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactSource::Created => "created",
            ArtifactSource::Uploaded => "uploaded",
        }
    }
}

// ---------------------------------------------------------------------------
// BackupArtifact
// ---------------------------------------------------------------------------

/// A finalized backup artifact.
///
/// Only constructed once size and checksum are known, so both are set
/// exactly once. Registered artifacts are never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub artifact_id: ArtifactId,
    pub backup_kind: BackupKind,
    pub source: ArtifactSource,
    /// Artifact directory.
    pub location: PathBuf,
    pub total_records: u64,
    pub total_files: u64,
    pub byte_size: u64,
    /// SHA-256 hex.
    pub checksum: String,
    pub schema_version: u32,
    /// Some entity types were omitted or unreadable.
    pub partial: bool,
    /// Record count per entity type.
    pub type_counts: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// BackupJob
// ---------------------------------------------------------------------------

/// Persisted lifecycle of one backup attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub job_id: JobId,
    pub backup_kind: BackupKind,
    pub quick: bool,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub byte_size: Option<u64>,
    pub checksum: Option<String>,
    pub artifact_id: Option<ArtifactId>,
    pub error_message: Option<String>,
    pub metadata: JobMetadata,
}

impl BackupJob {
    /// A fresh `in_progress` job starting now.
    pub fn start(backup_kind: BackupKind, quick: bool) -> Self {
        Self {
            job_id: JobId::new(),
            backup_kind,
            quick,
            status: JobStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            byte_size: None,
            checksum: None,
            artifact_id: None,
            error_message: None,
            metadata: JobMetadata::new(),
        }
    }

    /// Time elapsed since `started_at`, clamped at zero.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.started_at, now)
    }

    /// Apply a success transition. Caller checks the current status.
    pub fn apply_completion(&mut self, completion: JobCompletion, at: DateTime<Utc>) {
        self.status = JobStatus::Success;
        self.completed_at = Some(at);
        self.duration_seconds = Some(seconds_between(self.started_at, at));
        self.byte_size = Some(completion.byte_size);
        self.checksum = Some(completion.checksum);
        self.artifact_id = Some(completion.artifact_id);
        self.metadata.extend(completion.metadata);
    }

    /// Apply a failure transition. Caller checks the current status.
    pub fn apply_failure(&mut self, failure: JobFailure, at: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(at);
        self.duration_seconds = Some(seconds_between(self.started_at, at));
        self.error_message = Some(failure.error_message);
        self.metadata.extend(failure.metadata);
    }

    /// Build the terminal `success` row that represents ingestion of an
    /// uploaded artifact (not creation).
    pub fn ingested(artifact: &BackupArtifact, metadata: JobMetadata) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            backup_kind: artifact.backup_kind,
            quick: false,
            status: JobStatus::Success,
            started_at: now,
            completed_at: Some(now),
            duration_seconds: Some(0.0),
            byte_size: Some(artifact.byte_size),
            checksum: Some(artifact.checksum.clone()),
            artifact_id: Some(artifact.artifact_id.clone()),
            error_message: None,
            metadata,
        }
    }
}

/// Seconds from `start` to `end`, never negative.
pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

/// Data recorded when a job succeeds.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub artifact_id: ArtifactId,
    pub byte_size: u64,
    pub checksum: String,
    pub metadata: Vec<MetadataEntry>,
}

/// Data recorded when a job fails.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub error_message: String,
    pub metadata: Vec<MetadataEntry>,
}

impl JobFailure {
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            metadata: Vec::new(),
        }
    }

    pub fn with_entry(mut self, entry: MetadataEntry) -> Self {
        self.metadata.push(entry);
        self
    }
}

/// Filter for [`JobStore::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub kind: Option<BackupKind>,
    pub status: Option<JobStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_progress() -> Self {
        Self {
            status: Some(JobStatus::InProgress),
            ..Self::default()
        }
    }

    pub fn since(started_after: DateTime<Utc>) -> Self {
        Self {
            started_after: Some(started_after),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: BackupKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, job: &BackupJob) -> bool {
        self.kind.map(|k| job.backup_kind == k).unwrap_or(true)
            && self.status.map(|s| job.status == s).unwrap_or(true)
            && self
                .started_after
                .map(|t| job.started_at >= t)
                .unwrap_or(true)
            && self
                .started_before
                .map(|t| job.started_at < t)
                .unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// JobStore — Backup Job Persistence
// ---------------------------------------------------------------------------

/// Backup job ledger.
///
/// Guarantees:
/// - A job transitions `InProgress → Success | Failed`; terminal rows only
///   accept metadata annotations.
/// - At most one `InProgress` job exists per [`BackupKind`]
///   (`create_exclusive` is a compare-and-set).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create an `InProgress` job unless another `InProgress` job of the same
    /// kind exists, in which case `StorageError::JobInProgress` is returned.
    async fn create_exclusive(&self, kind: BackupKind, quick: bool) -> StorageResult<BackupJob>;

    /// Insert an already-terminal job row (upload ingestion).
    async fn insert_terminal(&self, job: BackupJob) -> StorageResult<()>;

    /// Transition an `InProgress` job to `Success`.
    async fn complete(&self, job_id: &JobId, completion: JobCompletion)
        -> StorageResult<BackupJob>;

    /// Transition an `InProgress` job to `Failed`.
    async fn fail(&self, job_id: &JobId, failure: JobFailure) -> StorageResult<BackupJob>;

    /// Append a metadata entry regardless of status.
    async fn annotate(&self, job_id: &JobId, entry: MetadataEntry) -> StorageResult<()>;

    /// Retrieve a job by ID.
    async fn get(&self, job_id: &JobId) -> StorageResult<BackupJob>;

    /// List jobs matching `filter`, newest `started_at` first.
    async fn list(&self, filter: &JobFilter) -> StorageResult<Vec<BackupJob>>;

    /// Find the job that produced or ingested `artifact_id`.
    async fn find_by_artifact(&self, artifact_id: &ArtifactId) -> StorageResult<Option<BackupJob>> {
        let jobs = self.list(&JobFilter::all()).await?;
        Ok(jobs
            .into_iter()
            .find(|j| j.artifact_id.as_ref() == Some(artifact_id)))
    }
}

// ---------------------------------------------------------------------------
// ArtifactRegistry — Finalized Artifacts
// ---------------------------------------------------------------------------

/// Registry of finalized artifacts.
///
/// Semantics:
/// - `register` is insert-only; re-registering an id fails with
///   `StorageError::DuplicateArtifact`.
/// - Artifacts are never deleted automatically (integrity failures are
///   reported, not cleaned up). `unregister` exists only to withdraw a
///   registration whose owning job row could not be written.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    async fn register(&self, artifact: BackupArtifact) -> StorageResult<()>;

    /// Remove a registration. Unknown ids are `ArtifactNotFound`.
    async fn unregister(&self, artifact_id: &ArtifactId) -> StorageResult<()>;

    async fn get(&self, artifact_id: &ArtifactId) -> StorageResult<BackupArtifact>;

    /// List artifacts, optionally filtered by kind, newest first.
    async fn list(&self, kind: Option<BackupKind>) -> StorageResult<Vec<BackupArtifact>>;
}
