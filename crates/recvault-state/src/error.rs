//! Error types for recvault-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the persistence backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by [`crate::JobStore`] and [`crate::ArtifactRegistry`].
#[derive(Error, Debug)]
pub enum StorageError {
    /// No job row with this id.
    #[error("backup job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// No artifact row with this id.
    #[error("backup artifact not found: {artifact_id}")]
    ArtifactNotFound { artifact_id: String },

    /// Artifact ids are registered once; finalized artifacts are immutable.
    #[error("backup artifact already registered: {artifact_id}")]
    DuplicateArtifact { artifact_id: String },

    /// Transition attempted from a state that does not allow it.
    #[error("job {job_id} is {status}, expected {expected}")]
    InvalidJobState {
        job_id: String,
        status: String,
        expected: String,
    },

    /// Another job of the same kind already holds the per-kind slot.
    #[error("a {kind} backup is already in progress (job {job_id})")]
    JobInProgress { kind: String, job_id: String },

    /// Lock poisoning, decode failures and other backend faults.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
