//! Row definitions for recvault SurrealDB tables
//!
//! Tables:
//! - backup_jobs: one row per backup attempt
//! - backup_artifacts: finalized artifacts (insert-only)
//! - backup_locks: per-kind in-progress slot
//!
//! Rows use plain strings for enums and ids so the tables stay readable from
//! the SurrealDB console; conversion to the typed `storage_traits` values
//! happens at the store boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::JobMetadata;
use crate::storage_traits::{
    ArtifactId, ArtifactSource, BackupArtifact, BackupJob, BackupKind, JobId, JobStatus,
};
use crate::StorageError;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

fn parse_kind(raw: &str) -> Result<BackupKind, StorageError> {
    raw.parse().map_err(StorageError::Backend)
}

/// `backup_jobs` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub job_id: String,
    pub backup_kind: String,
    pub quick: bool,
    /// "in_progress" | "success" | "failed"
    pub status: String,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub byte_size: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl From<&BackupJob> for JobRow {
    fn from(job: &BackupJob) -> Self {
        JobRow {
            job_id: job.job_id.0.clone(),
            backup_kind: job.backup_kind.as_str().to_string(),
            quick: job.quick,
            status: job.status.as_str().to_string(),
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_seconds: job.duration_seconds,
            byte_size: job.byte_size,
            checksum: job.checksum.clone(),
            artifact_id: job.artifact_id.as_ref().map(|a| a.0.clone()),
            error_message: job.error_message.clone(),
            metadata: job.metadata.to_value(),
        }
    }
}

impl TryFrom<JobRow> for BackupJob {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row.status.parse().map_err(StorageError::Backend)?;
        Ok(BackupJob {
            job_id: JobId(row.job_id),
            backup_kind: parse_kind(&row.backup_kind)?,
            quick: row.quick,
            status,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_seconds: row.duration_seconds,
            byte_size: row.byte_size,
            checksum: row.checksum,
            artifact_id: row.artifact_id.map(ArtifactId),
            error_message: row.error_message,
            metadata: JobMetadata::from_value(row.metadata),
        })
    }
}

/// `backup_artifacts` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub artifact_id: String,
    pub backup_kind: String,
    /// "created" | "uploaded"
    pub source: String,
    pub location: String,
    pub total_records: u64,
    pub total_files: u64,
    pub byte_size: u64,
    pub checksum: String,
    pub schema_version: u32,
    pub partial: bool,
    #[serde(default)]
    pub type_counts: BTreeMap<String, u64>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
}

impl From<&BackupArtifact> for ArtifactRow {
    fn from(a: &BackupArtifact) -> Self {
        ArtifactRow {
            artifact_id: a.artifact_id.0.clone(),
            backup_kind: a.backup_kind.as_str().to_string(),
            source: a.source.as_str().to_string(),
            location: a.location.to_string_lossy().into_owned(),
            total_records: a.total_records,
            total_files: a.total_files,
            byte_size: a.byte_size,
            checksum: a.checksum.clone(),
            schema_version: a.schema_version,
            partial: a.partial,
            type_counts: a.type_counts.clone(),
            created_at: a.created_at,
            description: a.description.clone(),
        }
    }
}

impl TryFrom<ArtifactRow> for BackupArtifact {
    type Error = StorageError;

    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        let source = match row.source.as_str() {
            "created" => ArtifactSource::Created,
            "uploaded" => ArtifactSource::Uploaded,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown artifact source: {other}"
                )))
            }
        };
        Ok(BackupArtifact {
            artifact_id: ArtifactId(row.artifact_id),
            backup_kind: parse_kind(&row.backup_kind)?,
            source,
            location: row.location.into(),
            total_records: row.total_records,
            total_files: row.total_files,
            byte_size: row.byte_size,
            checksum: row.checksum,
            schema_version: row.schema_version,
            partial: row.partial,
            type_counts: row.type_counts,
            created_at: row.created_at,
            description: row.description,
        })
    }
}

/// `backup_locks` row; record id is the backup kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRow {
    pub kind: String,
    pub job_id: String,
    #[serde(with = "surreal_datetime")]
    pub acquired_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataEntry;

    #[test]
    fn job_row_round_trip_preserves_fields() {
        let mut job = BackupJob::start(BackupKind::Full, true);
        job.metadata.push(MetadataEntry::QuickBackup {
            skipped_types: vec!["audit_log".into()],
        });

        let row = JobRow::from(&job);
        assert_eq!(row.status, "in_progress");
        assert_eq!(row.backup_kind, "full");

        let back = BackupJob::try_from(row).expect("row converts back");
        assert_eq!(back, job);
    }

    #[test]
    fn job_row_rejects_unknown_status() {
        let mut row = JobRow::from(&BackupJob::start(BackupKind::Database, false));
        row.status = "paused".into();
        assert!(BackupJob::try_from(row).is_err());
    }
}
