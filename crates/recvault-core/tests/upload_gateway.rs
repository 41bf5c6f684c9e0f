//! Upload validation and ingestion.

mod common;

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use common::{seed, Harness};
use flate2::write::GzEncoder;
use flate2::Compression;
use recvault_core::artifact::{self, records_path, write_line};
use recvault_core::{
    ArtifactHeader, ArtifactLine, ArtifactSource, ArtifactTrailer, BackupJob, BackupKind, JobId,
    JobStatus, JobStore, RestoreMode, RestoreOptions, RestoreStrategy, SerializedRecord,
    StorageError, UploadGateway, ValidationError, VaultError, CURRENT_SCHEMA_VERSION,
};
use recvault_state::fakes::MemoryJobStore;
use recvault_state::{
    ArtifactRegistry, JobCompletion, JobFailure, JobFilter, MetadataEntry, StorageResult,
};

/// Produce a real records file by backing up a seeded store.
async fn exported_records(h: &Harness) -> Vec<u8> {
    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Database, false, false)
        .await
        .expect("backup");
    let artifact = outcome.artifact.expect("artifact");
    std::fs::read(records_path(&artifact.location)).expect("records")
}

#[tokio::test]
async fn truncated_upload_is_rejected_without_side_effects() {
    let source = Harness::new();
    seed(&source.store, 2, 5, 5);
    let bytes = exported_records(&source).await;
    let truncated = bytes[..bytes.len() / 2].to_vec();

    let h = Harness::new();
    let err = h
        .vault
        .uploads
        .upload(std::io::Cursor::new(truncated), BackupKind::Database, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)), "{err}");

    assert!(h.artifacts.list(None).await.expect("list").is_empty());
    assert!(h.jobs.list(&JobFilter::all()).await.expect("list").is_empty());
    assert_eq!(
        std::fs::read_dir(h.backup_dir.path()).expect("ls").count(),
        0,
        "temp file discarded"
    );
}

#[tokio::test]
async fn gzip_upload_is_ingested_as_success_job() {
    let source = Harness::new();
    seed(&source.store, 2, 5, 5);
    let bytes = exported_records(&source).await;
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&bytes).expect("gzip");
    let gz = enc.finish().expect("gzip");

    let h = Harness::new();
    let artifact = h
        .vault
        .uploads
        .upload(
            std::io::Cursor::new(gz),
            BackupKind::Database,
            Some("nightly export".to_string()),
        )
        .await
        .expect("upload");

    assert_eq!(artifact.source, ArtifactSource::Uploaded);
    assert_eq!(artifact.total_records, 12);
    assert_eq!(artifact.total_files, 0);
    assert_eq!(
        std::fs::read(records_path(&artifact.location)).expect("stored"),
        bytes,
        "stored decompressed"
    );
    assert!(artifact::check(&artifact).passed);

    let job = h
        .jobs
        .find_by_artifact(&artifact.artifact_id)
        .await
        .expect("lookup")
        .expect("ingestion job");
    assert_eq!(job.status, JobStatus::Success);
    assert!(job.metadata.entries().iter().any(|e| matches!(
        e,
        MetadataEntry::Upload { description: Some(d), .. } if d == "nightly export"
    )));
}

#[tokio::test]
async fn declared_kind_must_match_header() {
    let source = Harness::new();
    seed(&source.store, 1, 1, 0);
    let bytes = exported_records(&source).await;

    let h = Harness::new();
    let err = h
        .vault
        .uploads
        .upload(std::io::Cursor::new(bytes), BackupKind::Full, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VaultError::Validation(ValidationError::KindMismatch { .. })
    ));
}

#[tokio::test]
async fn empty_and_foreign_uploads_are_rejected() {
    let h = Harness::new();
    let empty = h
        .vault
        .uploads
        .upload(std::io::Cursor::new(Vec::new()), BackupKind::Database, None)
        .await
        .unwrap_err();
    assert!(matches!(empty, VaultError::Validation(ValidationError::Empty)));

    let foreign = h
        .vault
        .uploads
        .upload(
            std::io::Cursor::new(b"id,name\n1,alice\n".to_vec()),
            BackupKind::Database,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(foreign, VaultError::Validation(_)));
    assert!(h.artifacts.is_empty());
}

#[tokio::test]
async fn uploaded_artifact_restores_into_empty_store() {
    let source = Harness::new();
    seed(&source.store, 2, 5, 5);
    let bytes = exported_records(&source).await;

    let h = Harness::new();
    let artifact = h
        .vault
        .uploads
        .upload(std::io::Cursor::new(bytes), BackupKind::Database, None)
        .await
        .expect("upload");

    let report = h
        .vault
        .restores
        .restore(
            &artifact.artifact_id,
            RestoreStrategy::Replace,
            RestoreMode::Execute,
            RestoreOptions::default(),
        )
        .await
        .expect("restore");
    assert!(report.conflicts.is_empty(), "{:?}", report.conflicts);
    assert_eq!(
        h.store.dump().expect("dump"),
        source.store.dump().expect("dump")
    );
}

#[tokio::test]
async fn record_with_blank_type_name_is_rejected() {
    let mut bytes = Vec::new();
    write_line(
        &mut bytes,
        &ArtifactLine::Header(ArtifactHeader::new(BackupKind::Database, false)),
    )
    .expect("header");
    let record = SerializedRecord {
        type_name: String::new(),
        key: "k".into(),
        schema_version: CURRENT_SCHEMA_VERSION,
        fields: Default::default(),
    };
    write_line(&mut bytes, &ArtifactLine::Record(record)).expect("record");
    let mut trailer = ArtifactTrailer {
        total_records: 1,
        ..Default::default()
    };
    trailer.type_counts.insert(String::new(), 1);
    write_line(&mut bytes, &ArtifactLine::Trailer(trailer)).expect("trailer");

    let h = Harness::new();
    let err = h
        .vault
        .uploads
        .upload(std::io::Cursor::new(bytes), BackupKind::Database, None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, VaultError::Validation(ValidationError::InvalidRecord { .. })),
        "{err}"
    );
    assert!(h.artifacts.is_empty());
    assert!(h.jobs.is_empty());
}

/// Job store whose ingestion insert always fails.
struct NoIngestJobs(MemoryJobStore);

#[async_trait]
impl JobStore for NoIngestJobs {
    async fn create_exclusive(&self, kind: BackupKind, quick: bool) -> StorageResult<BackupJob> {
        self.0.create_exclusive(kind, quick).await
    }

    async fn insert_terminal(&self, _job: BackupJob) -> StorageResult<()> {
        Err(StorageError::Backend("jobs table unavailable".into()))
    }

    async fn complete(&self, job_id: &JobId, completion: JobCompletion) -> StorageResult<BackupJob> {
        self.0.complete(job_id, completion).await
    }

    async fn fail(&self, job_id: &JobId, failure: JobFailure) -> StorageResult<BackupJob> {
        self.0.fail(job_id, failure).await
    }

    async fn annotate(&self, job_id: &JobId, entry: MetadataEntry) -> StorageResult<()> {
        self.0.annotate(job_id, entry).await
    }

    async fn get(&self, job_id: &JobId) -> StorageResult<BackupJob> {
        self.0.get(job_id).await
    }

    async fn list(&self, filter: &JobFilter) -> StorageResult<Vec<BackupJob>> {
        self.0.list(filter).await
    }
}

#[tokio::test]
async fn failed_ingestion_job_withdraws_the_artifact() {
    let source = Harness::new();
    seed(&source.store, 1, 2, 2);
    let bytes = exported_records(&source).await;

    let h = Harness::new();
    let gateway = UploadGateway::new(
        Arc::new(NoIngestJobs(MemoryJobStore::new())),
        h.artifacts.clone(),
        h.config.clone(),
    );
    let err = gateway
        .upload(std::io::Cursor::new(bytes), BackupKind::Database, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Storage(StorageError::Backend(_))), "{err}");
    assert!(h.artifacts.is_empty(), "registration withdrawn");
    assert_eq!(std::fs::read_dir(h.backup_dir.path()).expect("ls").count(), 0);
}
