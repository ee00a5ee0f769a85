//! Snapshot files - immutable views of data files taken before transfer.
//!
//! A hard link pins the inode, so compaction rewriting or removing the source
//! cannot change the bytes being sent. Where a link is impossible (another
//! filesystem, no link support) a full copy is made instead.

use crate::error::{Result, SyncError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// How the snapshot was materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    HardLink,
    Copy,
}

/// Removes the snapshot when dropped unless [`SnapshotFile::remove`] already did.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    source: PathBuf,
    kind: SnapshotKind,
    removed: bool,
}

impl SnapshotFile {
    /// Snapshot `source` into `snapshot_dir`, replacing a leftover of the same name.
    pub fn create(source: &Path, snapshot_dir: &Path) -> Result<Self> {
        let snapshot_err = |e: io::Error| SyncError::Snapshot {
            path: source.to_path_buf(),
            source: e,
        };

        let name = source.file_name().ok_or_else(|| {
            snapshot_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "source has no file name",
            ))
        })?;
        fs::create_dir_all(snapshot_dir).map_err(snapshot_err)?;

        let path = snapshot_dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Replaced stale snapshot {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(snapshot_err(e)),
        }

        let kind = match fs::hard_link(source, &path) {
            Ok(()) => SnapshotKind::HardLink,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(snapshot_err(e)),
            Err(e) => {
                tracing::debug!(
                    "Cannot hard link {} ({}), copying instead",
                    source.display(),
                    e
                );
                copy_snapshot(source, &path).map_err(snapshot_err)?;
                SnapshotKind::Copy
            }
        };

        Ok(Self {
            path,
            source: source.to_path_buf(),
            kind,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn kind(&self) -> SnapshotKind {
        self.kind
    }

    /// Delete the snapshot now. Only the snapshot entry goes; the source is untouched.
    pub fn remove(mut self) -> Result<()> {
        self.removed = true;
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for SnapshotFile {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Cannot remove snapshot {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

fn copy_snapshot(source: &Path, dest: &Path) -> io::Result<()> {
    let result = fs::copy(source, dest).and_then(|_| fs::File::open(dest)?.sync_all());
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

/// Remove snapshots left behind by a crashed process.
pub fn clear_stale_snapshots(snapshot_dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(snapshot_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(
            "Removed {} stale snapshot(s) from {}",
            removed,
            snapshot_dir.display()
        );
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_survives_source_removal() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("1.tsfile");
        fs::write(&source, b"committed data").unwrap();

        let snap = SnapshotFile::create(&source, &dir.path().join("snapshot")).unwrap();
        fs::remove_file(&source).unwrap();

        assert_eq!(fs::read(snap.path()).unwrap(), b"committed data");
        assert_eq!(snap.source(), source.as_path());
    }

    #[test]
    fn test_snapshot_survives_source_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("1.tsfile");
        fs::write(&source, b"before compaction").unwrap();

        let snap = SnapshotFile::create(&source, &dir.path().join("snapshot")).unwrap();

        // Compaction writes a new file and renames it over the old one
        let merged = dir.path().join("1.tsfile.merge");
        fs::write(&merged, b"after compaction, longer").unwrap();
        fs::rename(&merged, &source).unwrap();

        assert_eq!(fs::read(snap.path()).unwrap(), b"before compaction");
    }

    #[test]
    fn test_remove_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("1.tsfile");
        fs::write(&source, b"abc").unwrap();

        let snap = SnapshotFile::create(&source, &dir.path().join("snapshot")).unwrap();
        let snap_path = snap.path().to_path_buf();
        snap.remove().unwrap();

        assert!(!snap_path.exists());
        assert!(source.exists());
    }

    #[test]
    fn test_drop_removes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("1.tsfile");
        fs::write(&source, b"abc").unwrap();

        let snap_path = {
            let snap = SnapshotFile::create(&source, &dir.path().join("snapshot")).unwrap();
            snap.path().to_path_buf()
        };
        assert!(!snap_path.exists());
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = SnapshotFile::create(&dir.path().join("absent"), &dir.path().join("snapshot"))
            .unwrap_err();
        assert!(matches!(err, SyncError::Snapshot { .. }));
    }

    #[test]
    fn test_clear_stale_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_dir = dir.path().join("snapshot");
        fs::create_dir_all(&snapshot_dir).unwrap();
        fs::write(snapshot_dir.join("a.tsfile"), b"x").unwrap();
        fs::write(snapshot_dir.join("b.tsfile"), b"y").unwrap();

        assert_eq!(clear_stale_snapshots(&snapshot_dir).unwrap(), 2);
        assert_eq!(clear_stale_snapshots(&snapshot_dir).unwrap(), 0);
        assert_eq!(clear_stale_snapshots(&dir.path().join("absent")).unwrap(), 0);
    }
}
