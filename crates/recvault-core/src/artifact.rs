//! On-disk artifact format.
//!
//! ```text
//! <backup_root>/<artifact_id>/
//!   records.jsonl    header line, one line per record, trailer line
//!   manifest.json    summary; readable without parsing records
//!   media/           mirror of the media tree (media and full kinds)
//! ```
//!
//! The trailer carries the record counts, so a records file cut short in
//! transit never validates. The manifest is not part of the checksum since it
//! contains it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use recvault_state::{BackupArtifact, BackupKind};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::checksum::{self, DirDigestMode};
use crate::codec::{SerializedRecord, CURRENT_SCHEMA_VERSION, MIN_SCHEMA_VERSION};
use crate::error::ValidationError;

pub const RECORDS_FILE: &str = "records.jsonl";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const MEDIA_DIR: &str = "media";
pub const FORMAT_TAG: &str = "recvault-records";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub format: String,
    pub schema_version: u32,
    pub backup_kind: BackupKind,
    #[serde(default)]
    pub quick: bool,
    pub created_at: DateTime<Utc>,
}

impl ArtifactHeader {
    pub fn new(backup_kind: BackupKind, quick: bool) -> Self {
        Self {
            format: FORMAT_TAG.to_string(),
            schema_version: CURRENT_SCHEMA_VERSION,
            backup_kind,
            quick,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactTrailer {
    pub total_records: u64,
    /// Every captured type, including ones with zero records.
    pub type_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub skipped_types: Vec<String>,
    #[serde(default)]
    pub failed_types: Vec<String>,
}

impl ArtifactTrailer {
    pub fn partial(&self) -> bool {
        !self.skipped_types.is_empty() || !self.failed_types.is_empty()
    }
}

/// One line of `records.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "line", rename_all = "snake_case")]
pub enum ArtifactLine {
    Header(ArtifactHeader),
    Record(SerializedRecord),
    Trailer(ArtifactTrailer),
}

/// Write one line (JSON + newline) to `out`.
pub fn write_line<W: Write>(out: &mut W, line: &ArtifactLine) -> io::Result<()> {
    serde_json::to_writer(&mut *out, line)?;
    out.write_all(b"\n")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub artifact_id: String,
    pub backup_kind: BackupKind,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub quick: bool,
    pub partial: bool,
    pub total_records: u64,
    pub total_files: u64,
    pub byte_size: u64,
    pub type_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub skipped_types: Vec<String>,
    #[serde(default)]
    pub failed_types: Vec<String>,
    pub records_checksum: String,
    #[serde(default)]
    pub media_checksum: Option<String>,
    #[serde(default)]
    pub media_digest_mode: DirDigestMode,
    pub checksum: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Manifest {
    pub fn write_to(&self, dir: &Path) -> io::Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(dir.join(MANIFEST_FILE)).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> io::Result<Self> {
        let raw = fs::read(dir.join(MANIFEST_FILE))?;
        serde_json::from_slice(&raw).map_err(io::Error::from)
    }
}

pub fn records_path(dir: &Path) -> PathBuf {
    dir.join(RECORDS_FILE)
}

pub fn media_path(dir: &Path) -> PathBuf {
    dir.join(MEDIA_DIR)
}

/// What a successful [`scan`] saw.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub header: ArtifactHeader,
    pub trailer: ArtifactTrailer,
    pub records_seen: u64,
}

fn is_supported_version(version: u32) -> bool {
    (MIN_SCHEMA_VERSION..=CURRENT_SCHEMA_VERSION).contains(&version)
}

/// Walk a records file, checking its structure and handing each record to
/// `on_record` along with its 1-based line number.
///
/// Fails on a missing or foreign header, malformed lines, a missing trailer,
/// counts that disagree with the trailer, or anything after the trailer.
pub fn scan<R, F>(reader: R, mut on_record: F) -> Result<ScanSummary, ValidationError>
where
    R: BufRead,
    F: FnMut(usize, SerializedRecord) -> Result<(), ValidationError>,
{
    let mut lines = reader.lines().enumerate();

    let header = match lines.next() {
        None => return Err(ValidationError::Empty),
        Some((_, line)) => {
            let line = line?;
            match serde_json::from_str::<ArtifactLine>(&line) {
                Ok(ArtifactLine::Header(h)) => h,
                _ => return Err(ValidationError::MissingHeader),
            }
        }
    };
    if header.format != FORMAT_TAG {
        return Err(ValidationError::UnsupportedFormat(header.format));
    }
    if !is_supported_version(header.schema_version) {
        return Err(ValidationError::UnsupportedSchemaVersion {
            found: header.schema_version,
            min: MIN_SCHEMA_VERSION,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let mut observed: BTreeMap<String, u64> = BTreeMap::new();
    let mut records_seen = 0u64;
    let mut trailer = None;

    for (idx, line) in lines {
        let line_no = idx + 1;
        let line = line?;
        if trailer.is_some() {
            if line.trim().is_empty() {
                continue;
            }
            return Err(ValidationError::TrailingData { line: line_no });
        }
        let parsed: ArtifactLine =
            serde_json::from_str(&line).map_err(|e| ValidationError::MalformedLine {
                line: line_no,
                reason: e.to_string(),
            })?;
        match parsed {
            ArtifactLine::Header(_) => {
                return Err(ValidationError::MalformedLine {
                    line: line_no,
                    reason: "duplicate header".to_string(),
                })
            }
            ArtifactLine::Record(record) => {
                if record.type_name.is_empty() {
                    return Err(ValidationError::InvalidRecord {
                        line: line_no,
                        reason: format!("empty type name for key {}", record.key),
                    });
                }
                if record.key.is_empty() {
                    return Err(ValidationError::InvalidRecord {
                        line: line_no,
                        reason: format!("empty key for type {}", record.type_name),
                    });
                }
                if !is_supported_version(record.schema_version) {
                    return Err(ValidationError::InvalidRecord {
                        line: line_no,
                        reason: format!("unsupported schema version {}", record.schema_version),
                    });
                }
                *observed.entry(record.type_name.clone()).or_insert(0) += 1;
                records_seen += 1;
                on_record(line_no, record)?;
            }
            ArtifactLine::Trailer(t) => trailer = Some(t),
        }
    }

    let trailer = trailer.ok_or(ValidationError::MissingTrailer { records_seen })?;
    if trailer.total_records != records_seen {
        return Err(ValidationError::CountMismatch {
            detail: format!(
                "trailer declares {} records, found {records_seen}",
                trailer.total_records
            ),
        });
    }
    for (type_name, seen) in &observed {
        let declared = trailer.type_counts.get(type_name).copied().unwrap_or(0);
        if declared != *seen {
            return Err(ValidationError::CountMismatch {
                detail: format!("type {type_name}: trailer declares {declared}, found {seen}"),
            });
        }
    }
    for (type_name, declared) in &trailer.type_counts {
        if *declared > 0 && !observed.contains_key(type_name) {
            return Err(ValidationError::CountMismatch {
                detail: format!("type {type_name}: trailer declares {declared}, found 0"),
            });
        }
    }

    Ok(ScanSummary {
        header,
        trailer,
        records_seen,
    })
}

/// Scan the records file of an artifact directory.
pub fn scan_dir<F>(dir: &Path, on_record: F) -> Result<ScanSummary, ValidationError>
where
    F: FnMut(usize, SerializedRecord) -> Result<(), ValidationError>,
{
    let file = fs::File::open(records_path(dir))?;
    scan(BufReader::new(file), on_record)
}

/// Result of recomputing an artifact's checksum.
#[derive(Debug, Clone, PartialEq)]
pub struct ChecksumCheck {
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    /// Set when the artifact's files could not be read at all.
    pub error: Option<String>,
}

/// Recompute the checksum of a registered artifact from its files.
///
/// The media tree is folded in when the manifest recorded a media digest, or
/// when no manifest exists but a media directory does.
pub fn recompute_checksum(dir: &Path) -> io::Result<String> {
    let records_digest = checksum::digest_file(&records_path(dir))?;
    let media = media_path(dir);
    let media_digest = match Manifest::read_from(dir) {
        Ok(manifest) => match manifest.media_checksum {
            Some(_) => Some(checksum::digest_dir(&media, manifest.media_digest_mode)?),
            None => None,
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if media.is_dir() {
                Some(checksum::digest_dir(&media, DirDigestMode::default())?)
            } else {
                None
            }
        }
        Err(e) => return Err(e),
    };
    Ok(checksum::artifact_checksum(
        &records_digest,
        media_digest.as_deref(),
    ))
}

/// Compare an artifact's recorded checksum with one recomputed from disk.
pub fn check(artifact: &BackupArtifact) -> ChecksumCheck {
    match recompute_checksum(&artifact.location) {
        Ok(actual) => ChecksumCheck {
            passed: actual.eq_ignore_ascii_case(&artifact.checksum),
            expected: artifact.checksum.clone(),
            actual,
            error: None,
        },
        Err(e) => ChecksumCheck {
            expected: artifact.checksum.clone(),
            actual: String::new(),
            passed: false,
            error: Some(e.to_string()),
        },
    }
}
