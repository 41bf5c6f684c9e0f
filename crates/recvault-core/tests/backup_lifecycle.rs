//! Backup orchestration end to end over the in-memory stores.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{seed, Harness, SlowStore};
use recvault_core::artifact::{self, Manifest};
use recvault_core::checksum::DirDigestMode;
use recvault_core::{BackupKind, JobStatus, JobStore, MemoryRecordStore, VaultError};
use recvault_state::{ArtifactRegistry, JobFilter, MetadataEntry, StorageError};

#[tokio::test]
async fn quick_database_backup_of_fifty_records() {
    let h = Harness::new();
    seed(&h.store, 5, 20, 25);

    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Database, true, false)
        .await
        .expect("backup");

    assert!(outcome.succeeded());
    let artifact = outcome.artifact.expect("artifact");
    assert_eq!(artifact.total_records, 50);
    assert!(!artifact.checksum.is_empty());
    assert_eq!(outcome.job.status, JobStatus::Success);
    assert_eq!(outcome.job.checksum.as_deref(), Some(artifact.checksum.as_str()));
    assert!(artifact.partial, "quick database backups are always partial");
    assert_eq!(
        outcome.job.metadata.skipped_types(),
        vec!["audit_log"],
        "quick mode records the skipped type"
    );
}

#[tokio::test]
async fn duration_matches_timestamps() {
    let h = Harness::new();
    seed(&h.store, 2, 4, 4);

    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Database, false, false)
        .await
        .expect("backup");

    let job = outcome.job;
    let completed_at = job.completed_at.expect("completed_at");
    let expected = (completed_at - job.started_at).num_milliseconds() as f64 / 1000.0;
    let duration = job.duration_seconds.expect("duration");
    assert!((duration - expected).abs() < 0.01, "{duration} vs {expected}");
    assert!(!job.metadata.entries().iter().any(|e| matches!(e, MetadataEntry::QuickBackup { .. })));
}

#[tokio::test]
async fn redigest_reproduces_stored_checksum() {
    let h = Harness::with_config(|c| c.with_dir_digest_mode(DirDigestMode::Contents));
    seed(&h.store, 2, 6, 9);
    h.write_media("scans/p-000.pdf", b"%PDF-1.4 scan");
    h.write_media("photos/p-001.jpg", b"\xff\xd8\xff jpeg");

    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Full, false, true)
        .await
        .expect("backup");
    let artifact = outcome.artifact.expect("artifact");
    assert_eq!(artifact.total_files, 2);

    let report = outcome.verification.expect("verification");
    assert!(report.passed);
    assert_eq!(report.actual, artifact.checksum);
    assert!(outcome.job.metadata.latest_verification().expect("annotated").passed);

    let manifest = Manifest::read_from(&artifact.location).expect("manifest");
    assert_eq!(manifest.checksum, artifact.checksum);
    assert_eq!(manifest.media_digest_mode, DirDigestMode::Contents);
    assert_eq!(
        artifact::recompute_checksum(&artifact.location).expect("recompute"),
        artifact.checksum
    );
}

#[tokio::test]
async fn tampered_artifact_fails_verification_and_is_kept() {
    let h = Harness::new();
    seed(&h.store, 1, 3, 0);
    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Database, false, false)
        .await
        .expect("backup");
    let artifact = outcome.artifact.expect("artifact");

    let records = artifact::records_path(&artifact.location);
    let mut body = std::fs::read_to_string(&records).expect("read");
    body = body.replace("Patient 1", "Patient X");
    std::fs::write(&records, body).expect("tamper");

    let report = h
        .vault
        .orchestrator
        .verify(&artifact.artifact_id)
        .await
        .expect("verify");
    assert!(!report.passed);
    assert!(report.integrity_error().is_some());
    assert!(records.exists(), "artifact is never auto-deleted");
    assert!(h.artifacts.get(&artifact.artifact_id).await.is_ok());

    let job = h.jobs.get(&outcome.job.job_id).await.expect("job");
    assert!(!job.metadata.latest_verification().expect("annotated").passed);
}

#[tokio::test]
async fn second_job_of_same_kind_is_rejected_while_first_runs() {
    let h = Harness::new();
    let first = h
        .vault
        .orchestrator
        .enqueue(BackupKind::Database, false)
        .await
        .expect("enqueue");

    let err = h
        .vault
        .orchestrator
        .enqueue(BackupKind::Database, true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VaultError::Storage(StorageError::JobInProgress { .. })
    ));

    // A different kind is independent.
    h.vault
        .orchestrator
        .enqueue(BackupKind::Media, false)
        .await
        .expect("media enqueue");

    let outcome = h
        .vault
        .orchestrator
        .execute(&first.job_id)
        .await
        .expect("execute");
    assert!(outcome.succeeded());
    h.vault
        .orchestrator
        .enqueue(BackupKind::Database, false)
        .await
        .expect("slot released");
}

#[tokio::test]
async fn executing_a_terminal_job_is_refused() {
    let h = Harness::new();
    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Database, false, false)
        .await
        .expect("backup");
    let err = h
        .vault
        .orchestrator
        .execute(&outcome.job.job_id)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::JobNotRunnable { .. }));
}

#[tokio::test]
async fn unreadable_type_yields_partial_success() {
    let h = Harness::new();
    seed(&h.store, 2, 4, 6);
    h.store.fail_reads_for("visit").expect("fault");

    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Database, false, false)
        .await
        .expect("backup");

    assert!(outcome.succeeded());
    let artifact = outcome.artifact.expect("artifact");
    assert!(artifact.partial);
    assert_eq!(artifact.total_records, 6);
    assert!(!artifact.type_counts.contains_key("visit"));
    let failures = outcome.job.metadata.source_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].type_name, "visit");
}

#[tokio::test]
async fn media_backup_without_media_root_fails_the_job() {
    let h = Harness::with_config(|mut c| {
        c.media_root = None;
        c
    });
    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Media, false, false)
        .await
        .expect("outcome");
    assert_eq!(outcome.job.status, JobStatus::Failed);
    assert!(outcome.job.error_message.is_some());
    assert!(outcome.artifact.is_none());
    assert_eq!(std::fs::read_dir(h.backup_dir.path()).expect("ls").count(), 0);
}

#[tokio::test]
async fn budget_exhaustion_fails_job_with_elapsed_time() {
    let memory = Arc::new(MemoryRecordStore::new());
    seed(&memory, 3, 30, 30);
    let slow = Arc::new(SlowStore {
        inner: memory.clone(),
        delay: Duration::from_millis(40),
    });
    let h = Harness::with_store(slow, memory, |c| {
        c.with_budgets(Duration::from_millis(60), Duration::from_millis(60))
            .with_timeout_grace(Duration::from_secs(5))
    });

    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Database, false, false)
        .await
        .expect("outcome");

    assert_eq!(outcome.job.status, JobStatus::Failed);
    let message = outcome.job.error_message.clone().expect("message");
    assert!(message.contains("timed out"), "{message}");
    assert!(outcome.job.metadata.timed_out());
    assert!(outcome.artifact.is_none());
    assert_eq!(std::fs::read_dir(h.backup_dir.path()).expect("ls").count(), 0);
}

#[tokio::test]
async fn hard_timeout_backs_the_cooperative_budget() {
    let memory = Arc::new(MemoryRecordStore::new());
    seed(&memory, 1, 1, 0);
    let stalled = Arc::new(SlowStore {
        inner: memory.clone(),
        delay: Duration::from_secs(30),
    });
    let h = Harness::with_store(stalled, memory, |c| {
        c.with_budgets(Duration::from_millis(50), Duration::from_millis(50))
            .with_timeout_grace(Duration::from_millis(50))
    });

    let outcome = h
        .vault
        .orchestrator
        .create_backup(BackupKind::Database, false, false)
        .await
        .expect("outcome");
    assert_eq!(outcome.job.status, JobStatus::Failed);
    assert!(outcome.job.metadata.timed_out());
}

fn slow_harness(delay: Duration) -> Harness {
    let memory = Arc::new(MemoryRecordStore::new());
    seed(&memory, 1, 3, 3);
    let slow = Arc::new(SlowStore {
        inner: memory.clone(),
        delay,
    });
    Harness::with_store(slow, memory, |c| c)
}

#[tokio::test]
async fn sweep_during_execute_leaves_no_registered_artifact() {
    let h = slow_harness(Duration::from_millis(200));
    let job = h
        .vault
        .orchestrator
        .enqueue(BackupKind::Database, false)
        .await
        .expect("enqueue");

    let (executed, swept) = tokio::join!(h.vault.orchestrator.execute(&job.job_id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.vault.orchestrator.cleanup_stuck(0, false).await
    });

    assert_eq!(swept.expect("sweep").affected.len(), 1);
    let err = executed.unwrap_err();
    assert!(
        matches!(err, VaultError::Storage(StorageError::InvalidJobState { .. })),
        "{err}"
    );
    let failed = h.jobs.get(&job.job_id).await.expect("job");
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.artifact_id.is_none());
    assert!(h.artifacts.list(None).await.expect("list").is_empty());
    assert_eq!(std::fs::read_dir(h.backup_dir.path()).expect("ls").count(), 0);
}

#[tokio::test]
async fn concurrent_executes_register_one_artifact() {
    let h = slow_harness(Duration::from_millis(20));
    let job = h
        .vault
        .orchestrator
        .enqueue(BackupKind::Database, false)
        .await
        .expect("enqueue");

    let (first, second) = tokio::join!(
        h.vault.orchestrator.execute(&job.job_id),
        h.vault.orchestrator.execute(&job.job_id)
    );
    assert_eq!(
        [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
        1,
        "exactly one executor finishes the job"
    );

    let done = h.jobs.get(&job.job_id).await.expect("job");
    assert_eq!(done.status, JobStatus::Success);
    let registered = h.artifacts.list(None).await.expect("list");
    assert_eq!(registered.len(), 1);
    assert_eq!(done.artifact_id.as_ref(), Some(&registered[0].artifact_id));
    assert_eq!(std::fs::read_dir(h.backup_dir.path()).expect("ls").count(), 1);
}

#[tokio::test]
async fn cleanup_on_terminal_jobs_affects_nothing() {
    let h = Harness::new();
    h.vault
        .orchestrator
        .create_backup(BackupKind::Database, false, false)
        .await
        .expect("backup");

    let report = h
        .vault
        .orchestrator
        .cleanup_stuck(0, false)
        .await
        .expect("cleanup");
    assert_eq!(report.scanned, 0);
    assert!(report.affected.is_empty());
}

#[tokio::test]
async fn cleanup_fails_stuck_jobs_once() {
    let h = Harness::new();
    let job = h
        .vault
        .orchestrator
        .enqueue(BackupKind::Full, false)
        .await
        .expect("enqueue");

    let dry = h
        .vault
        .orchestrator
        .cleanup_stuck(0, true)
        .await
        .expect("dry run");
    assert_eq!(dry.affected.len(), 1);
    assert_eq!(
        h.jobs.get(&job.job_id).await.expect("job").status,
        JobStatus::InProgress,
        "dry run changes nothing"
    );

    let swept = h
        .vault
        .orchestrator
        .cleanup_stuck(0, false)
        .await
        .expect("sweep");
    assert_eq!(swept.affected.len(), 1);
    let failed = h.jobs.get(&job.job_id).await.expect("job");
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.metadata.was_swept());
    assert!(failed.duration_seconds.is_some());

    let again = h
        .vault
        .orchestrator
        .cleanup_stuck(0, false)
        .await
        .expect("sweep again");
    assert!(again.affected.is_empty());
    assert!(h
        .jobs
        .list(&JobFilter::in_progress())
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn cleanup_leaves_young_jobs_alone() {
    let h = Harness::new();
    h.vault
        .orchestrator
        .enqueue(BackupKind::Database, false)
        .await
        .expect("enqueue");
    let report = h
        .vault
        .orchestrator
        .cleanup_stuck(30, false)
        .await
        .expect("cleanup");
    assert_eq!(report.scanned, 1);
    assert!(report.affected.is_empty());
}
