//! Upload gateway: ingest an externally supplied records file as an artifact.
//!
//! The stream is staged into a temp file in the backup root while being
//! hashed, then scanned end to end. Nothing is registered, and no directory
//! is created, unless the whole file validates. Live data is never touched.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use flate2::read::MultiGzDecoder;
use recvault_state::{
    ArtifactId, ArtifactRegistry, ArtifactSource, BackupArtifact, BackupJob, BackupKind,
    JobMetadata, JobStore, MetadataEntry,
};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::artifact::{records_path, scan, Manifest, ScanSummary};
use crate::checksum::{DirDigestMode, HashingWriter};
use crate::error::{ValidationError, VaultResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::orchestrator::withdraw;
use crate::snapshot::discard_dir;
use crate::VaultConfig;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

struct StagedUpload {
    temp: NamedTempFile,
    summary: ScanSummary,
    records_checksum: String,
    byte_size: u64,
}

/// Copy `reader` into a temp file under `root`, transparently gunzipping,
/// and validate the result as a records file of kind `declared`.
fn stage_upload<'a, R: Read + 'a>(
    reader: R,
    root: &Path,
    declared: BackupKind,
) -> Result<StagedUpload, ValidationError> {
    fs::create_dir_all(root)?;

    let mut buffered = BufReader::new(reader);
    let gzipped = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);
    let mut source: Box<dyn Read + 'a> = if gzipped {
        Box::new(MultiGzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };

    let temp = NamedTempFile::new_in(root)?;
    let mut writer = HashingWriter::new(BufWriter::new(temp));
    io::copy(&mut source, &mut writer).map_err(|e| {
        if gzipped {
            ValidationError::Decompress(e.to_string())
        } else {
            ValidationError::Io(e)
        }
    })?;
    let (buffered_out, records_checksum, byte_size) = writer.finish()?;
    let temp = buffered_out
        .into_inner()
        .map_err(|e| ValidationError::Io(e.into_error()))?;
    if byte_size == 0 {
        return Err(ValidationError::Empty);
    }

    let summary = scan(BufReader::new(temp.reopen()?), |_, _| Ok(()))?;
    if summary.header.backup_kind != declared {
        return Err(ValidationError::KindMismatch {
            declared,
            found: summary.header.backup_kind,
        });
    }
    debug!(
        records = summary.records_seen,
        bytes = byte_size,
        gzipped,
        "upload staged"
    );

    Ok(StagedUpload {
        temp,
        summary,
        records_checksum,
        byte_size,
    })
}

pub struct UploadGateway {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactRegistry>,
    config: VaultConfig,
}

impl UploadGateway {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactRegistry>,
        config: VaultConfig,
    ) -> Self {
        Self {
            jobs,
            artifacts,
            config,
        }
    }

    /// Validate and register an uploaded records stream (plain or gzip).
    pub async fn upload<R>(
        &self,
        reader: R,
        declared_kind: BackupKind,
        description: Option<String>,
    ) -> VaultResult<BackupArtifact>
    where
        R: Read + Send + 'static,
    {
        let root = self.config.backup_root.clone();
        let staged = tokio::task::spawn_blocking(move || {
            stage_upload(reader, &root, declared_kind)
        })
        .await?;
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                obs::emit_upload_rejected(&e);
                return Err(e.into());
            }
        };

        let artifact_id = ArtifactId::new();
        let dir = self.config.artifact_dir(&artifact_id.0);
        fs::create_dir_all(&dir)?;
        let header = staged.summary.header;
        let trailer = staged.summary.trailer;

        let artifact = BackupArtifact {
            artifact_id: artifact_id.clone(),
            backup_kind: header.backup_kind,
            source: ArtifactSource::Uploaded,
            location: dir.clone(),
            total_records: staged.summary.records_seen,
            total_files: 0,
            byte_size: staged.byte_size,
            checksum: staged.records_checksum.clone(),
            schema_version: header.schema_version,
            partial: trailer.partial(),
            type_counts: trailer.type_counts.clone(),
            created_at: Utc::now(),
            description: description.clone(),
        };
        let manifest = Manifest {
            artifact_id: artifact_id.0.clone(),
            backup_kind: header.backup_kind,
            schema_version: header.schema_version,
            created_at: artifact.created_at,
            quick: header.quick,
            partial: artifact.partial,
            total_records: artifact.total_records,
            total_files: 0,
            byte_size: artifact.byte_size,
            type_counts: trailer.type_counts,
            skipped_types: trailer.skipped_types,
            failed_types: trailer.failed_types,
            records_checksum: staged.records_checksum,
            media_checksum: None,
            media_digest_mode: DirDigestMode::default(),
            checksum: artifact.checksum.clone(),
            description: description.clone(),
        };

        let persisted = staged
            .temp
            .persist(records_path(&dir))
            .map_err(|e| e.error)
            .and_then(|_| manifest.write_to(&dir));
        if let Err(e) = persisted {
            discard_dir(&dir);
            return Err(e.into());
        }
        if let Err(e) = self.artifacts.register(artifact.clone()).await {
            discard_dir(&dir);
            return Err(e.into());
        }

        let metadata = JobMetadata::from_entries(vec![MetadataEntry::Upload {
            description,
            declared_kind,
        }]);
        if let Err(e) = self
            .jobs
            .insert_terminal(BackupJob::ingested(&artifact, metadata))
            .await
        {
            withdraw(self.artifacts.as_ref(), &artifact).await;
            return Err(e.into());
        }

        METRICS.inc_uploads_ingested();
        obs::emit_upload_ingested(
            &artifact.artifact_id.0,
            artifact.backup_kind.as_str(),
            artifact.total_records,
        );
        Ok(artifact)
    }

    /// Convenience wrapper over [`UploadGateway::upload`] for a local file.
    pub async fn upload_file(
        &self,
        path: &Path,
        declared_kind: BackupKind,
        description: Option<String>,
    ) -> VaultResult<BackupArtifact> {
        let file = File::open(path)?;
        self.upload(file, declared_kind, description).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{write_line, ArtifactHeader, ArtifactLine, ArtifactTrailer};
    use crate::codec::{encode, Entity};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn records(kind: BackupKind) -> Vec<u8> {
        let mut out = Vec::new();
        write_line(&mut out, &ArtifactLine::Header(ArtifactHeader::new(kind, false))).unwrap();
        write_line(
            &mut out,
            &ArtifactLine::Record(encode(&Entity::new("patient", "p-1")).unwrap()),
        )
        .unwrap();
        let mut trailer = ArtifactTrailer {
            total_records: 1,
            ..Default::default()
        };
        trailer.type_counts.insert("patient".into(), 1);
        write_line(&mut out, &ArtifactLine::Trailer(trailer)).unwrap();
        out
    }

    #[test]
    fn stages_plain_and_gzip_identically() {
        let root = tempfile::tempdir().unwrap();
        let plain = records(BackupKind::Database);

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&plain).unwrap();
        let gz = enc.finish().unwrap();

        let a = stage_upload(plain.as_slice(), root.path(), BackupKind::Database).unwrap();
        let b = stage_upload(gz.as_slice(), root.path(), BackupKind::Database).unwrap();
        assert_eq!(a.records_checksum, b.records_checksum);
        assert_eq!(b.summary.records_seen, 1);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let err = stage_upload(
            records(BackupKind::Database).as_slice(),
            root.path(),
            BackupKind::Full,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ValidationError::KindMismatch { .. }));
    }

    #[test]
    fn corrupt_gzip_is_a_decompress_error() {
        let root = tempfile::tempdir().unwrap();
        let junk = [0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad, 0xbe, 0xef];
        let err = stage_upload(&junk[..], root.path(), BackupKind::Database)
            .err()
            .unwrap();
        assert!(matches!(err, ValidationError::Decompress(_)));
    }

    #[test]
    fn rejected_upload_leaves_no_files() {
        let root = tempfile::tempdir().unwrap();
        let _ = stage_upload(&b"garbage\n"[..], root.path(), BackupKind::Database);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
