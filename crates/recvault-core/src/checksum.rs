//! SHA-256 digests over files, directory trees and byte streams.
//!
//! All digests are lowercase hex. Directory digests walk the tree in sorted
//! order and ignore OS housekeeping files, so the same tree produces the
//! same digest on every platform.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

const READ_CHUNK: usize = 64 * 1024;

/// File names that never contribute to a directory digest and are never
/// copied into or out of an artifact.
pub const HOUSEKEEPING_FILES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", ".gitkeep"];

/// True for files written by the OS or by tooling rather than the application.
pub fn is_housekeeping(file_name: &str) -> bool {
    HOUSEKEEPING_FILES.contains(&file_name) || file_name.starts_with("._")
}

/// How a directory tree is folded into one digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirDigestMode {
    /// Sorted relative paths only. Cheap, detects added/removed/renamed files.
    #[default]
    Paths,
    /// Sorted relative paths plus each file's content digest.
    Contents,
}

impl DirDigestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirDigestMode::Paths => "paths",
            DirDigestMode::Contents => "contents",
        }
    }
}

impl fmt::Display for DirDigestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DirDigestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paths" => Ok(DirDigestMode::Paths),
            "contents" => Ok(DirDigestMode::Contents),
            other => Err(format!("unknown directory digest mode: {other}")),
        }
    }
}

/// Hex SHA-256 of a byte slice.
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of everything `reader` yields.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a file's contents, streamed in fixed-size chunks.
pub fn digest_file(path: &Path) -> io::Result<String> {
    digest_reader(File::open(path)?)
}

/// Relative, forward-slash paths of every non-housekeeping file under `root`,
/// sorted.
pub fn list_files(root: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if is_housekeeping(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        files.push(parts.join("/"));
    }
    files.sort();
    Ok(files)
}

/// Digest a directory tree according to `mode`.
pub fn digest_dir(root: &Path, mode: DirDigestMode) -> io::Result<String> {
    let files = list_files(root)?;
    let mut hasher = Sha256::new();
    for (i, rel) in files.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(rel.as_bytes());
        if mode == DirDigestMode::Contents {
            let content = digest_file(&root.join(rel))?;
            hasher.update(b"\t");
            hasher.update(content.as_bytes());
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest a file or a directory, whichever `path` is.
pub fn digest_path(path: &Path, mode: DirDigestMode) -> io::Result<String> {
    if path.is_dir() {
        digest_dir(path, mode)
    } else {
        digest_file(path)
    }
}

/// Recompute the digest of `path` and compare it with `expected`.
pub fn verify(path: &Path, expected: &str, mode: DirDigestMode) -> io::Result<bool> {
    Ok(digest_path(path, mode)?.eq_ignore_ascii_case(expected))
}

/// Fold several digests into one: SHA-256 of the newline-joined parts.
pub fn combine(parts: &[&str]) -> String {
    digest_bytes(parts.join("\n").as_bytes())
}

/// Checksum recorded for an artifact: the records-file digest alone, or the
/// combination of records and media digests when a media tree exists.
pub fn artifact_checksum(records_digest: &str, media_digest: Option<&str>) -> String {
    match media_digest {
        Some(media) => combine(&[records_digest, media]),
        None => records_digest.to_string(),
    }
}

/// `Write` adapter that hashes and counts every byte on its way through.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Flush the inner writer and return it with the hex digest and byte count.
    pub fn finish(mut self) -> io::Result<(W, String, u64)> {
        self.inner.flush()?;
        Ok((self.inner, hex::encode(self.hasher.finalize()), self.bytes))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn digest_bytes_known_vector() {
        assert_eq!(
            digest_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn housekeeping_names() {
        assert!(is_housekeeping(".DS_Store"));
        assert!(is_housekeeping("Thumbs.db"));
        assert!(is_housekeeping("._photo.jpg"));
        assert!(!is_housekeeping("photo.jpg"));
    }

    #[test]
    fn dir_digest_ignores_housekeeping() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for dir in [a.path(), b.path()] {
            fs::create_dir_all(dir.join("scans")).unwrap();
            fs::write(dir.join("scans/x.png"), b"png").unwrap();
        }
        fs::write(b.path().join(".DS_Store"), b"junk").unwrap();
        fs::write(b.path().join("scans/._x.png"), b"junk").unwrap();

        for mode in [DirDigestMode::Paths, DirDigestMode::Contents] {
            assert_eq!(
                digest_dir(a.path(), mode).unwrap(),
                digest_dir(b.path(), mode).unwrap()
            );
        }
    }

    #[test]
    fn contents_mode_detects_edits_paths_mode_does_not() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"one").unwrap();
        let paths_before = digest_dir(dir.path(), DirDigestMode::Paths).unwrap();
        let contents_before = digest_dir(dir.path(), DirDigestMode::Contents).unwrap();

        fs::write(dir.path().join("a.txt"), b"two").unwrap();
        assert_eq!(
            paths_before,
            digest_dir(dir.path(), DirDigestMode::Paths).unwrap()
        );
        assert_ne!(
            contents_before,
            digest_dir(dir.path(), DirDigestMode::Contents).unwrap()
        );
    }

    #[test]
    fn hashing_writer_matches_digest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut w = HashingWriter::new(File::create(&path).unwrap());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (_, digest, bytes) = w.finish().unwrap();

        assert_eq!(bytes, 11);
        assert_eq!(digest, digest_file(&path).unwrap());
        assert!(verify(&path, &digest, DirDigestMode::Paths).unwrap());
    }

    #[test]
    fn artifact_checksum_without_media_is_records_digest() {
        assert_eq!(artifact_checksum("abc", None), "abc");
        assert_eq!(artifact_checksum("abc", Some("def")), combine(&["abc", "def"]));
    }

    #[test]
    fn mode_parses() {
        assert_eq!("Contents".parse::<DirDigestMode>().unwrap(), DirDigestMode::Contents);
        assert!("blocks".parse::<DirDigestMode>().is_err());
    }
}
