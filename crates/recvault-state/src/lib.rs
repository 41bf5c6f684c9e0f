//! recvault-state: persisted state of the backup engine
//!
//! This crate owns the rows that survive process restarts: backup job
//! lifecycles and finalized artifacts. Nothing about a running backup is kept
//! only in memory, so restarts and horizontal scaling never lose history.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: job state machine integrity, per-kind mutual exclusion, immutable
//! artifact registration.
//!
//! ## Key Components
//!
//! - `JobStore` / `ArtifactRegistry`: backend-agnostic traits
//! - `SurrealBackupStore`: SurrealDB implementation of both
//! - `fakes`: in-memory implementations for tests
//! - `JobMetadata`: typed view over the schemaless metadata column

mod error;
pub mod fakes;
mod handle;
pub mod metadata;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{connect, DbConfig, DbCredentials, DEFAULT_LOCAL_PATH};
pub use metadata::{JobMetadata, MetadataEntry, SourceFailure, VerificationInfo};
pub use schema::{ArtifactRow, JobRow, LockRow};
pub use storage_traits::{
    seconds_between, ArtifactId, ArtifactRegistry, ArtifactSource, BackupArtifact, BackupJob,
    BackupKind, JobCompletion, JobFailure, JobFilter, JobId, JobStatus, JobStore, StorageResult,
};
pub use surreal_store::SurrealBackupStore;

/// Result type for recvault-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
