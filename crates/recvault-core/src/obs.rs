//! Structured observability hooks for backup, restore and health events.
//!
//! This module provides:
//! - Job-scoped tracing spans via the `JobSpan` RAII guard
//! - Emission functions for key lifecycle events
//!
//! Events are emitted at `info!` level (warnings for failures). For JSON
//! output, pass `--json` to the CLI or call `init_tracing(true, ..)`.

use tracing::{info, warn};

/// RAII guard that enters a job-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = JobSpan::enter("9f1c…", "database");
/// // every event below carries job_id and kind
/// ```
pub struct JobSpan {
    _span: tracing::span::EnteredSpan,
}

impl JobSpan {
    pub fn enter(job_id: &str, kind: &str) -> Self {
        Self {
            _span: job_span(job_id, kind).entered(),
        }
    }
}

/// The span behind [`JobSpan`], for instrumenting futures that cross awaits.
pub fn job_span(job_id: &str, kind: &str) -> tracing::Span {
    tracing::info_span!("recvault.job", job_id = %job_id, kind = %kind)
}

pub fn emit_backup_started(job_id: &str, kind: &str, quick: bool) {
    info!(event = "backup.started", job_id = %job_id, kind = %kind, quick = quick);
}

pub fn emit_backup_finished(
    job_id: &str,
    kind: &str,
    total_records: u64,
    byte_size: u64,
    duration_seconds: f64,
) {
    info!(
        event = "backup.finished",
        job_id = %job_id,
        kind = %kind,
        total_records = total_records,
        byte_size = byte_size,
        duration_seconds = duration_seconds,
    );
}

pub fn emit_backup_failed(job_id: &str, kind: &str, error: &dyn std::fmt::Display) {
    warn!(event = "backup.failed", job_id = %job_id, kind = %kind, error = %error);
}

/// A type left out of a snapshot on purpose (quick mode).
pub fn emit_type_skipped(type_name: &str, reason: &str) {
    info!(event = "snapshot.type_skipped", type_name = %type_name, reason = %reason);
}

/// A type that could not be read; the snapshot continues without it.
pub fn emit_source_failure(type_name: &str, error: &dyn std::fmt::Display) {
    warn!(event = "snapshot.source_failure", type_name = %type_name, error = %error);
}

pub fn emit_stuck_job(job_id: &str, kind: &str, elapsed_seconds: f64, dry_run: bool) {
    warn!(
        event = "cleanup.stuck_job",
        job_id = %job_id,
        kind = %kind,
        elapsed_seconds = elapsed_seconds,
        dry_run = dry_run,
    );
}

pub fn emit_verification(artifact_id: &str, passed: bool) {
    if passed {
        info!(event = "artifact.verified", artifact_id = %artifact_id, passed = true);
    } else {
        warn!(event = "artifact.verified", artifact_id = %artifact_id, passed = false);
    }
}

pub fn emit_upload_ingested(artifact_id: &str, kind: &str, total_records: u64) {
    info!(
        event = "upload.ingested",
        artifact_id = %artifact_id,
        kind = %kind,
        total_records = total_records,
    );
}

pub fn emit_upload_rejected(error: &dyn std::fmt::Display) {
    warn!(event = "upload.rejected", error = %error);
}

pub fn emit_restore_finished(attempt_id: &str, artifact_id: &str, mode: &str, status: &str) {
    info!(
        event = "restore.finished",
        attempt_id = %attempt_id,
        artifact_id = %artifact_id,
        mode = %mode,
        status = %status,
    );
}

pub fn emit_alert(kind: &str, severity: &str, message: &str) {
    warn!(event = "health.alert", kind = %kind, severity = %severity, message = %message);
}
