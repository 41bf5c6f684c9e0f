//! Byte-for-byte mirroring of media trees into and out of artifacts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::checksum;
use crate::snapshot::Deadline;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media source {0} does not exist")]
    MissingSource(PathBuf),

    #[error("media copy failed: {0}")]
    Io(#[from] io::Error),

    #[error("media copy exceeded its {budget_seconds}s budget after {elapsed_seconds:.1}s")]
    Timeout {
        elapsed_seconds: f64,
        budget_seconds: u64,
    },
}

/// What to do when a destination file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    Overwrite,
    SkipExisting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub files: u64,
    pub bytes: u64,
    pub skipped_existing: u64,
}

/// Copy every non-housekeeping file under `src` to the same relative path
/// under `dst`. Checks `deadline` before each file.
pub fn mirror_tree(
    src: &Path,
    dst: &Path,
    policy: OverwritePolicy,
    deadline: Option<&Deadline>,
) -> Result<MirrorStats, MediaError> {
    if !src.is_dir() {
        return Err(MediaError::MissingSource(src.to_path_buf()));
    }
    fs::create_dir_all(dst)?;

    let mut stats = MirrorStats::default();
    for rel in checksum::list_files(src)? {
        if let Some(d) = deadline {
            if d.is_expired() {
                return Err(MediaError::Timeout {
                    elapsed_seconds: d.elapsed().as_secs_f64(),
                    budget_seconds: d.budget().as_secs(),
                });
            }
        }
        let target = dst.join(&rel);
        if policy == OverwritePolicy::SkipExisting && target.exists() {
            stats.skipped_existing += 1;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        stats.bytes += fs::copy(src.join(&rel), &target)?;
        stats.files += 1;
    }
    Ok(stats)
}

/// Number of files [`mirror_tree`] would copy from `src`.
pub fn count_files(src: &Path) -> io::Result<u64> {
    if !src.is_dir() {
        return Ok(0);
    }
    Ok(checksum::list_files(src)?.len() as u64)
}
