//! Disk-resident sender state.
//!
//! - `position`: confirmed schema-log line count
//! - `fileset`: per storage group last-known manifest and pending work
//! - `recovery`: append-only log of steps completed in an unfinished cycle
//!
//! All files are plain text, one record per line.

pub mod fileset;
pub mod position;
pub mod recovery;

pub use fileset::{scan_storage_groups, GroupPaths, ScannedGroup, StorageGroupFileSet};
pub use position::SchemaPosition;
pub use recovery::{RecoveredProgress, RecoveryEntry, RecoveryLog};

use std::fs;
use std::io;
use std::path::Path;

/// Write `path` via a sibling temp file and rename, fsyncing the data first.
pub(crate) fn write_atomic<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_file = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_file)?;
        write(&mut file)?;
        file.sync_all()?;
    }

    // Atomic rename
    fs::rename(&temp_file, path)?;

    // The rename itself is durable only once the directory entry is synced.
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        fs::File::open(dir)?.sync_all()?;
    }
    Ok(())
}
