//! Snapshot writer: streams live records and media into an artifact directory.
//!
//! Records are read in key-ordered batches and encoded one line at a time,
//! so memory stays bounded by the batch size. Each type is first spooled to
//! a temp file inside the artifact directory and appended to `records.jsonl`
//! only once fully read; a type whose read fails midway leaves no lines
//! behind. The deadline is checked between batches and between media files.
//! Any fatal error or timeout removes the artifact directory.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use recvault_state::{ArtifactId, ArtifactSource, BackupArtifact, BackupKind};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::artifact::{
    media_path, records_path, write_line, ArtifactHeader, ArtifactLine, ArtifactTrailer, Manifest,
};
use crate::catalog::Catalog;
use crate::checksum::{self, DirDigestMode, HashingWriter};
use crate::codec::{encode, CURRENT_SCHEMA_VERSION};
use crate::host::RecordStore;
use crate::media::{self, MediaError, OverwritePolicy};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot exceeded its {budget_seconds}s budget after {elapsed_seconds:.1}s")]
    Timeout {
        elapsed_seconds: f64,
        budget_seconds: u64,
    },

    #[error("failed to write artifact: {0}")]
    Output(#[from] io::Error),

    #[error("media root is not configured")]
    MediaRootMissing,

    #[error("media source {0} does not exist")]
    MediaSourceMissing(PathBuf),

    #[error("media copy task failed: {0}")]
    Task(String),
}

impl From<MediaError> for SnapshotError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::MissingSource(p) => SnapshotError::MediaSourceMissing(p),
            MediaError::Io(e) => SnapshotError::Output(e),
            MediaError::Timeout {
                elapsed_seconds,
                budget_seconds,
            } => SnapshotError::Timeout {
                elapsed_seconds,
                budget_seconds,
            },
        }
    }
}

/// One entity type could not be read; the snapshot carries on without it.
#[derive(Debug, Clone, Error)]
#[error("failed to read {type_name}: {reason}")]
pub struct PartialSourceError {
    pub type_name: String,
    pub reason: String,
}

/// Wall-clock budget for a snapshot, checked cooperatively.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    pub fn check(&self) -> Result<(), SnapshotError> {
        if self.is_expired() {
            return Err(SnapshotError::Timeout {
                elapsed_seconds: self.elapsed().as_secs_f64(),
                budget_seconds: self.budget.as_secs(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub batch_size: usize,
    pub media_root: Option<PathBuf>,
    pub digest_mode: DirDigestMode,
}

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub artifact_id: ArtifactId,
    pub kind: BackupKind,
    pub quick: bool,
    pub description: Option<String>,
}

impl SnapshotRequest {
    pub fn new(kind: BackupKind, quick: bool) -> Self {
        Self {
            artifact_id: ArtifactId::new(),
            kind,
            quick,
            description: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub artifact: BackupArtifact,
    pub manifest: Manifest,
    pub skipped_types: Vec<String>,
    pub failures: Vec<PartialSourceError>,
}

struct Spool {
    file: NamedTempFile,
    count: u64,
}

enum SpoolError {
    Fatal(SnapshotError),
    Source(PartialSourceError),
}

impl From<io::Error> for SpoolError {
    fn from(e: io::Error) -> Self {
        SpoolError::Fatal(SnapshotError::Output(e))
    }
}

/// Remove a half-written artifact directory, logging rather than failing.
pub(crate) fn discard_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %e, "failed to remove incomplete artifact");
        }
    }
}

#[derive(Clone)]
pub struct SnapshotWriter {
    store: Arc<dyn RecordStore>,
    catalog: Arc<Catalog>,
    settings: SnapshotSettings,
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn RecordStore>, catalog: Arc<Catalog>, settings: SnapshotSettings) -> Self {
        Self {
            store,
            catalog,
            settings,
        }
    }

    pub fn settings(&self) -> &SnapshotSettings {
        &self.settings
    }

    /// Write `<backup_root>/<artifact_id>/`. On error nothing is left behind.
    pub async fn write(
        &self,
        backup_root: &Path,
        request: &SnapshotRequest,
        deadline: Deadline,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let dir = backup_root.join(&request.artifact_id.0);
        fs::create_dir_all(&dir)?;
        match self.write_into(&dir, request, deadline).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                discard_dir(&dir);
                Err(e)
            }
        }
    }

    async fn write_into(
        &self,
        dir: &Path,
        request: &SnapshotRequest,
        deadline: Deadline,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let header = ArtifactHeader::new(request.kind, request.quick);
        let created_at = header.created_at;

        let file = File::create(records_path(dir))?;
        let mut out = HashingWriter::new(BufWriter::new(file));
        write_line(&mut out, &ArtifactLine::Header(header))?;

        let mut trailer = ArtifactTrailer::default();
        let mut failures = Vec::new();

        if request.kind.includes_records() {
            for desc in self.catalog.ordered() {
                let type_name = desc.type_name.as_str();
                if request.quick && desc.skippable_in_quick {
                    obs::emit_type_skipped(type_name, "quick backup");
                    trailer.skipped_types.push(type_name.to_string());
                    continue;
                }
                deadline.check()?;
                match self.spool_type(dir, type_name, &deadline).await {
                    Ok(spool) => {
                        let mut reader = spool.file.reopen()?;
                        io::copy(&mut reader, &mut out)?;
                        debug!(type_name, records = spool.count, "type captured");
                        trailer.total_records += spool.count;
                        trailer.type_counts.insert(type_name.to_string(), spool.count);
                    }
                    Err(SpoolError::Fatal(e)) => return Err(e),
                    Err(SpoolError::Source(failure)) => {
                        obs::emit_source_failure(type_name, &failure);
                        trailer.failed_types.push(type_name.to_string());
                        failures.push(failure);
                    }
                }
            }
        }

        write_line(&mut out, &ArtifactLine::Trailer(trailer.clone()))?;
        let (buffered, records_checksum, records_bytes) = out.finish()?;
        buffered
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        let mut total_files = 0;
        let mut media_bytes = 0;
        let mut media_checksum = None;
        if request.kind.includes_media() {
            let src = self
                .settings
                .media_root
                .clone()
                .ok_or(SnapshotError::MediaRootMissing)?;
            let dst = media_path(dir);
            let mode = self.settings.digest_mode;
            let (stats, digest) = tokio::task::spawn_blocking(move || {
                let stats = media::mirror_tree(&src, &dst, OverwritePolicy::Overwrite, Some(&deadline))?;
                let digest = checksum::digest_dir(&dst, mode)?;
                Ok::<_, SnapshotError>((stats, digest))
            })
            .await
            .map_err(|e| SnapshotError::Task(e.to_string()))??;
            total_files = stats.files;
            media_bytes = stats.bytes;
            media_checksum = Some(digest);
            METRICS.add_media_files_copied(stats.files);
        }

        let checksum = checksum::artifact_checksum(&records_checksum, media_checksum.as_deref());
        let partial = trailer.partial() || (request.quick && request.kind.includes_records());
        let byte_size = records_bytes + media_bytes;

        let manifest = Manifest {
            artifact_id: request.artifact_id.0.clone(),
            backup_kind: request.kind,
            schema_version: CURRENT_SCHEMA_VERSION,
            created_at,
            quick: request.quick,
            partial,
            total_records: trailer.total_records,
            total_files,
            byte_size,
            type_counts: trailer.type_counts.clone(),
            skipped_types: trailer.skipped_types.clone(),
            failed_types: trailer.failed_types.clone(),
            records_checksum,
            media_checksum,
            media_digest_mode: self.settings.digest_mode,
            checksum: checksum.clone(),
            description: request.description.clone(),
        };
        manifest.write_to(dir)?;
        METRICS.add_records_written(trailer.total_records);

        let artifact = BackupArtifact {
            artifact_id: request.artifact_id.clone(),
            backup_kind: request.kind,
            source: ArtifactSource::Created,
            location: dir.to_path_buf(),
            total_records: trailer.total_records,
            total_files,
            byte_size,
            checksum,
            schema_version: CURRENT_SCHEMA_VERSION,
            partial,
            type_counts: trailer.type_counts,
            created_at,
            description: request.description.clone(),
        };

        Ok(SnapshotOutcome {
            artifact,
            manifest,
            skipped_types: trailer.skipped_types,
            failures,
        })
    }

    /// Read one type in batches into a temp file beside the records file.
    async fn spool_type(
        &self,
        dir: &Path,
        type_name: &str,
        deadline: &Deadline,
    ) -> Result<Spool, SpoolError> {
        let file = NamedTempFile::new_in(dir)?;
        let mut count = 0u64;
        {
            let mut out = BufWriter::new(file.as_file());
            let batch_size = self.settings.batch_size.max(1);
            let mut after: Option<String> = None;
            loop {
                deadline.check().map_err(SpoolError::Fatal)?;
                let batch = self
                    .store
                    .read_batch(type_name, after.as_deref(), batch_size)
                    .await
                    .map_err(|e| {
                        SpoolError::Source(PartialSourceError {
                            type_name: type_name.to_string(),
                            reason: e.to_string(),
                        })
                    })?;
                let fetched = batch.len();
                for entity in &batch {
                    let record = encode(entity).map_err(|e| {
                        SpoolError::Source(PartialSourceError {
                            type_name: type_name.to_string(),
                            reason: format!("record {}: {e}", entity.key),
                        })
                    })?;
                    write_line(&mut out, &ArtifactLine::Record(record))?;
                    count += 1;
                }
                if let Some(last) = batch.last() {
                    after = Some(last.key.clone());
                }
                if fetched < batch_size {
                    break;
                }
            }
            out.flush()?;
        }
        Ok(Spool { file, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{self, scan_dir};
    use crate::catalog::EntityTypeDescriptor;
    use crate::codec::{Entity, FieldValue};
    use crate::host::MemoryRecordStore;

    fn catalog() -> Arc<Catalog> {
        Arc::new(
            Catalog::build(vec![
                EntityTypeDescriptor::new("patient"),
                EntityTypeDescriptor::new("audit_log").skippable(),
            ])
            .unwrap(),
        )
    }

    fn store_with(n: usize) -> Arc<MemoryRecordStore> {
        let store = MemoryRecordStore::new();
        for i in 0..n {
            store
                .insert(
                    Entity::new("patient", format!("p-{i:04}"))
                        .with_field("n", FieldValue::Int(i as i64)),
                )
                .unwrap();
        }
        store.insert(Entity::new("audit_log", "l-1")).unwrap();
        Arc::new(store)
    }

    fn writer(store: Arc<MemoryRecordStore>, batch_size: usize) -> SnapshotWriter {
        SnapshotWriter::new(
            store,
            catalog(),
            SnapshotSettings {
                batch_size,
                media_root: None,
                digest_mode: DirDigestMode::Paths,
            },
        )
    }

    #[tokio::test]
    async fn batches_cover_every_record() {
        let root = tempfile::tempdir().unwrap();
        let w = writer(store_with(25), 10);
        let request = SnapshotRequest::new(BackupKind::Database, false);
        let outcome = w
            .write(root.path(), &request, Deadline::new(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(outcome.artifact.total_records, 26);
        assert_eq!(outcome.artifact.type_counts["patient"], 25);
        assert!(!outcome.artifact.partial);

        let summary = scan_dir(&outcome.artifact.location, |_, _| Ok(())).unwrap();
        assert_eq!(summary.records_seen, 26);
        assert_eq!(
            artifact::recompute_checksum(&outcome.artifact.location).unwrap(),
            outcome.artifact.checksum
        );
    }

    #[tokio::test]
    async fn quick_skips_flagged_types_and_marks_partial() {
        let root = tempfile::tempdir().unwrap();
        let w = writer(store_with(3), 1000);
        let request = SnapshotRequest::new(BackupKind::Database, true);
        let outcome = w
            .write(root.path(), &request, Deadline::new(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(outcome.skipped_types, vec!["audit_log"]);
        assert!(outcome.artifact.partial);
        assert!(!outcome.artifact.type_counts.contains_key("audit_log"));
    }

    #[tokio::test]
    async fn failing_type_is_left_out() {
        let root = tempfile::tempdir().unwrap();
        let store = store_with(3);
        store.fail_reads_for("audit_log").unwrap();
        let w = writer(store, 1000);
        let outcome = w
            .write(
                root.path(),
                &SnapshotRequest::new(BackupKind::Database, false),
                Deadline::new(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].type_name, "audit_log");
        assert!(outcome.artifact.partial);
        assert_eq!(outcome.artifact.total_records, 3);
        assert_eq!(outcome.manifest.failed_types, vec!["audit_log"]);
    }

    #[tokio::test]
    async fn expired_deadline_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let w = writer(store_with(3), 1000);
        let request = SnapshotRequest::new(BackupKind::Database, false);
        let err = w
            .write(root.path(), &request, Deadline::new(Duration::ZERO))
            .await
            .unwrap_err();

        assert!(matches!(err, SnapshotError::Timeout { .. }));
        assert!(!root.path().join(&request.artifact_id.0).exists());
    }

    #[tokio::test]
    async fn media_kind_without_root_fails() {
        let root = tempfile::tempdir().unwrap();
        let w = writer(store_with(0), 1000);
        let request = SnapshotRequest::new(BackupKind::Media, false);
        let err = w
            .write(root.path(), &request, Deadline::new(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::MediaRootMissing));
        assert!(!root.path().join(&request.artifact_id.0).exists());
    }

    #[tokio::test]
    async fn full_backup_mirrors_media() {
        let root = tempfile::tempdir().unwrap();
        let media_root = tempfile::tempdir().unwrap();
        fs::create_dir_all(media_root.path().join("scans")).unwrap();
        fs::write(media_root.path().join("scans/x.png"), b"png").unwrap();

        let w = SnapshotWriter::new(
            store_with(2),
            catalog(),
            SnapshotSettings {
                batch_size: 1000,
                media_root: Some(media_root.path().to_path_buf()),
                digest_mode: DirDigestMode::Contents,
            },
        );
        let outcome = w
            .write(
                root.path(),
                &SnapshotRequest::new(BackupKind::Full, false),
                Deadline::new(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.artifact.total_files, 1);
        assert!(outcome.artifact.location.join("media/scans/x.png").exists());
        assert_eq!(
            artifact::recompute_checksum(&outcome.artifact.location).unwrap(),
            outcome.artifact.checksum
        );
    }
}
