//! Single-writer ingestion lock.
//!
//! An advisory exclusive lock on `<store>/<collection>.lock`. It is held
//! for the duration of an ingestion run and released on drop, so a crash
//! never leaves a stale lock behind. Failing to acquire means another
//! writer (in this or another process) is still indexing.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct IngestLock {
    file: File,
    path: PathBuf,
}

impl IngestLock {
    /// `Ok(None)` when another writer holds the lock.
    pub fn try_acquire(store_dir: &Path, collection: &str) -> Result<Option<Self>> {
        std::fs::create_dir_all(store_dir)
            .with_context(|| format!("Failed to create store directory {}", store_dir.display()))?;
        let path = store_dir.join(format!("{}.lock", collection));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                tracing::info!(path = %path.display(), "ingestion already in progress");
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }
}

impl Drop for IngestLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release ingest lock");
        }
    }
}
