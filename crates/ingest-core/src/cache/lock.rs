//! Cross-process write serialization via an exclusive file lock.
//!
//! Grounded on the `fs2::FileExt` idiom: open (or create) a sibling lock
//! file next to the index, take an exclusive advisory lock around the
//! write, and release it when the guard drops.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};

/// An exclusive lock over a namespace's `index.lock` file. Held for the
/// duration of a write batch; readers never need to take it because the
/// SQLite index runs in WAL mode.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Open (creating if necessary) the lock file at `path` and block until
    /// an exclusive lock is acquired.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IngestError::io_with_path(e, parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| IngestError::io_with_path(e, &path))?;
        file.lock_exclusive().map_err(|e| IngestError::CacheLock {
            namespace: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { file, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("failed to release cache lock {:?}: {e}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_parent_and_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("ns").join("index.lock");
        let guard = FileLock::acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
        drop(guard);
    }
}
