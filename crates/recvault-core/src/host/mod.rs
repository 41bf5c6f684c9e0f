//! The application's live record store, as seen by the backup engine.
//!
//! The engine never reaches into the host's tables directly: it reads pages
//! of entities for snapshots and hands whole per-type batches back on
//! restore. Both write operations are all-or-nothing per call.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::Entity;

pub use fs::FsRecordStore;
pub use memory::MemoryRecordStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown entity type: {type_name}")]
    UnknownType { type_name: String },

    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("write to {type_name} rejected: {reason}")]
    WriteRejected { type_name: String, reason: String },

    #[error("record store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Row counts from one atomic write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Number of live records of `type_name`.
    async fn count(&self, type_name: &str) -> StoreResult<u64>;

    /// Up to `limit` records ordered by key, starting after `after_key`.
    async fn read_batch(
        &self,
        type_name: &str,
        after_key: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Entity>>;

    async fn exists(&self, type_name: &str, key: &str) -> StoreResult<bool>;

    /// Atomically delete every record of `type_name` and insert `entities`.
    async fn replace_all(&self, type_name: &str, entities: Vec<Entity>)
        -> StoreResult<WriteSummary>;

    /// Atomically insert or update `entities` by natural key. Never deletes.
    async fn upsert(&self, type_name: &str, entities: Vec<Entity>) -> StoreResult<WriteSummary>;
}
