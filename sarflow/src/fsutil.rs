//! Filesystem primitives shared by the registry and the pipeline.
//!
//! Durable files are always replaced through a temp file in the same
//! directory followed by a rename, so readers see either the old or the new
//! content and never a partial write.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Name prefix of staged temp files.
pub const STAGE_PREFIX: &str = ".sarflow-stage-";

/// Existence and size of a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Missing,
    Empty,
    Present(u64),
}

impl FileStatus {
    /// True when the file exists with non-zero length.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

/// Status of `path`. A path whose metadata cannot be read counts as missing.
pub fn file_status(path: &Path) -> FileStatus {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => FileStatus::Present(meta.len()),
        Ok(meta) if meta.is_file() => FileStatus::Empty,
        _ => FileStatus::Missing,
    }
}

/// Creates a temp file next to `path` holding `bytes`, flushed to disk.
///
/// The caller decides when (or whether) to persist it over `path`.
pub fn stage_file(path: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;
    let mut temp = tempfile::Builder::new().prefix(STAGE_PREFIX).tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

/// Renames a staged temp file over `path` and syncs the directory entry.
pub fn persist_staged(temp: NamedTempFile, path: &Path) -> io::Result<()> {
    temp.persist(path).map_err(|e| e.error)?;
    sync_dir(parent_dir(path));
    Ok(())
}

/// Atomically replaces `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp = stage_file(path, bytes)?;
    persist_staged(temp, path)
}

/// Staged temp files in `dir` untouched for longer than `older_than`.
///
/// A writer that crashed between staging and publishing leaves one behind.
pub fn stale_stage_files(dir: &Path, older_than: Duration) -> io::Result<Vec<PathBuf>> {
    let mut stale = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(stale),
        Err(e) => return Err(e),
    };
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(STAGE_PREFIX) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok());
        if age.is_some_and(|age| age > older_than) {
            stale.push(entry.path());
        }
    }
    stale.sort();
    Ok(stale)
}

/// Removes a directory tree, treating "not found" as success.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Best effort: some filesystems refuse fsync on directories.
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_status() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.tif");
        let empty = dir.path().join("empty.tif");
        let full = dir.path().join("full.tif");
        fs::write(&empty, b"").unwrap();
        fs::write(&full, b"abc").unwrap();

        assert_eq!(file_status(&missing), FileStatus::Missing);
        assert_eq!(file_status(&empty), FileStatus::Empty);
        assert_eq!(file_status(&full), FileStatus::Present(3));
        assert_eq!(file_status(dir.path()), FileStatus::Missing);
        assert!(file_status(&full).is_usable());
        assert!(!file_status(&empty).is_usable());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        // No temp files left behind
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_dropped_stage_leaves_target_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"original").unwrap();

        let staged = stage_file(&path, b"replacement").unwrap();
        drop(staged);

        assert_eq!(fs::read(&path).unwrap(), b"original");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_stale_stage_files_only_lists_old_stages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        let staged = stage_file(&path, b"abandoned").unwrap();
        let (_, staged_path) = staged.keep().unwrap();
        fs::write(dir.path().join("notes.tmp"), b"other").unwrap();

        assert!(stale_stage_files(dir.path(), Duration::from_secs(3600))
            .unwrap()
            .is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let stale = stale_stage_files(dir.path(), Duration::from_millis(1)).unwrap();
        assert_eq!(stale, vec![staged_path]);
        assert!(stale_stage_files(&dir.path().join("absent"), Duration::ZERO)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_remove_dir_if_exists() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        remove_dir_if_exists(&dir.path().join("a")).unwrap();
        assert!(!nested.exists());
        remove_dir_if_exists(&dir.path().join("a")).unwrap();
    }
}
