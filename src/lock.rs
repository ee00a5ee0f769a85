//! Single-instance guard.
//!
//! An exclusive OS lock on the sender's lock file. The kernel drops the lock
//! when the process exits, whether cleanly or not.

use crate::error::{Result, SyncError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Holds the lock for as long as it is alive.
#[derive(Debug)]
pub struct InstanceGuard {
    file: File,
    path: PathBuf,
}

impl InstanceGuard {
    /// Create the lock file if needed and take the lock without waiting.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(SyncError::AlreadyRunning(path.to_path_buf()));
        }

        tracing::debug!("Acquired sender lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Unable to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sender").join("sync.lock");

        let guard = InstanceGuard::acquire(&path).unwrap();
        assert!(path.exists());

        let err = InstanceGuard::acquire(&path).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning(_)));
        assert!(err.stops_agent());

        drop(guard);
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");

        drop(InstanceGuard::acquire(&path).unwrap());
        let again = InstanceGuard::acquire(&path).unwrap();
        assert_eq!(again.path(), path.as_path());
    }
}
