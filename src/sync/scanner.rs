//! Local directory scanner.
//!
//! Walks the sync root and produces one [`FileEntry`] per regular file.
//! Manifest paths are normalized to forward slashes and case-folded so the
//! diff behaves the same on case-sensitive and case-insensitive
//! filesystems; the original-case absolute path is kept alongside for
//! actual I/O. Symlinks and non-regular files are skipped.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use walkdir::WalkDir;

use crate::wire::FileEntry;

/// One scanned file: the manifest entry plus where it actually lives.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Manifest entry (folded relative path, size, mtime ticks).
    pub entry: FileEntry,
    /// Original-case absolute path for opening the file.
    pub absolute: PathBuf,
}

/// Number of 100 ns ticks, the manifest's timestamp unit.
fn ticks_from(mtime: SystemTime) -> i64 {
    match mtime.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_nanos() / 100).min(i64::MAX as u128) as i64,
        // Pre-epoch mtimes clamp to zero.
        Err(_) => 0,
    }
}

/// Forward-slash, lower-cased path relative to the root.
fn fold_relative(relative: &Path) -> String {
    let joined = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    joined.to_lowercase()
}

/// Walk `root` and collect every regular file.
pub fn scan(root: &Path) -> io::Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    for dirent in WalkDir::new(root).follow_links(false) {
        let dirent = dirent.map_err(io::Error::from)?;
        if !dirent.file_type().is_file() {
            continue;
        }

        let metadata = dirent.metadata().map_err(io::Error::from)?;
        let relative = dirent
            .path()
            .strip_prefix(root)
            .map_err(|_| io::Error::other("walked entry outside scan root"))?;

        files.push(ScannedFile {
            entry: FileEntry {
                relative_path: fold_relative(relative),
                size: metadata.len(),
                last_write_ticks: ticks_from(metadata.modified()?),
                hash: None,
            },
            absolute: dirent.into_path(),
        });
    }
    Ok(files)
}

/// Project the wire manifest from a scan.
pub fn manifest(files: &[ScannedFile]) -> Vec<FileEntry> {
    files.iter().map(|file| file.entry.clone()).collect()
}
