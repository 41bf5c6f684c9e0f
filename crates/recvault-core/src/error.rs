//! Error types surfaced by the backup engine.

use recvault_state::{BackupKind, StorageError};
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::codec::CodecError;
use crate::host::StoreError;
use crate::snapshot::SnapshotError;

/// A supplied artifact (upload or on-disk records file) is malformed.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("artifact is empty")]
    Empty,

    #[error("failed to decompress upload: {0}")]
    Decompress(String),

    #[error("first line is not an artifact header")]
    MissingHeader,

    #[error("unsupported artifact format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported schema version {found} (supported {min}..={max})")]
    UnsupportedSchemaVersion { found: u32, min: u32, max: u32 },

    #[error("declared kind {declared} does not match artifact kind {found}")]
    KindMismatch {
        declared: BackupKind,
        found: BackupKind,
    },

    #[error("line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },

    #[error("line {line}: invalid record: {reason}")]
    InvalidRecord { line: usize, reason: String },

    #[error("artifact is truncated: no trailer after {records_seen} records")]
    MissingTrailer { records_seen: u64 },

    #[error("trailer does not match contents: {detail}")]
    CountMismatch { detail: String },

    #[error("line {line}: data after trailer")]
    TrailingData { line: usize },

    #[error("I/O error reading artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Recomputed checksum differs from the recorded one.
#[derive(Debug, Clone, Error)]
#[error("checksum mismatch for artifact {artifact_id}: expected {expected}, actual {actual}")]
pub struct IntegrityError {
    pub artifact_id: String,
    pub expected: String,
    pub actual: String,
}

/// Top-level error for engine operations.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("state store error: {0}")]
    Storage(#[from] StorageError),

    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("job {job_id} is {status}, expected in_progress")]
    JobNotRunnable { job_id: String, status: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;
