// Recovery log - steps of the current cycle already confirmed by the receiver
//
// One log per storage group. Every confirmed deletion notice and file
// transfer is appended and synced before the sender moves on, so a crash at
// any point leaves a log that tells exactly which work is already done.
//
// Format (one record per line):
//   begin-deletions
//   file-name-deleted <path>
//   begin-files
//   file-synced <path>

use crate::error::Result;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const BEGIN_DELETIONS: &str = "begin-deletions";
const FILE_NAME_DELETED: &str = "file-name-deleted";
const BEGIN_FILES: &str = "begin-files";
const FILE_SYNCED: &str = "file-synced";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEntry {
    BeginDeletions,
    FileNameDeleted(PathBuf),
    BeginFiles,
    FileSynced(PathBuf),
}

impl RecoveryEntry {
    fn to_line(&self) -> String {
        match self {
            RecoveryEntry::BeginDeletions => BEGIN_DELETIONS.to_string(),
            RecoveryEntry::FileNameDeleted(path) => {
                format!("{} {}", FILE_NAME_DELETED, path.display())
            }
            RecoveryEntry::BeginFiles => BEGIN_FILES.to_string(),
            RecoveryEntry::FileSynced(path) => format!("{} {}", FILE_SYNCED, path.display()),
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let (tag, payload) = match line.split_once(' ') {
            Some((tag, payload)) => (tag, Some(payload)),
            None => (line, None),
        };
        match (tag, payload) {
            (BEGIN_DELETIONS, None) => Some(RecoveryEntry::BeginDeletions),
            (BEGIN_FILES, None) => Some(RecoveryEntry::BeginFiles),
            (FILE_NAME_DELETED, Some(p)) if !p.is_empty() => {
                Some(RecoveryEntry::FileNameDeleted(PathBuf::from(p)))
            }
            (FILE_SYNCED, Some(p)) if !p.is_empty() => {
                Some(RecoveryEntry::FileSynced(PathBuf::from(p)))
            }
            _ => None,
        }
    }
}

/// What a previous, unfinished cycle already completed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveredProgress {
    pub deleted: BTreeSet<PathBuf>,
    pub synced: BTreeSet<PathBuf>,
}

impl RecoveredProgress {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.synced.is_empty()
    }

    /// Re-applying an entry that is already present changes nothing.
    pub fn apply(&mut self, entry: RecoveryEntry) {
        match entry {
            RecoveryEntry::FileNameDeleted(path) => {
                self.deleted.insert(path);
            }
            RecoveryEntry::FileSynced(path) => {
                self.synced.insert(path);
            }
            RecoveryEntry::BeginDeletions | RecoveryEntry::BeginFiles => {}
        }
    }
}

/// Append-only writer plus replay for one storage group.
#[derive(Debug)]
pub struct RecoveryLog {
    path: PathBuf,
    file: Option<File>,
}

impl RecoveryLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read every complete record. A torn last line (crash mid-append) and
    /// unknown records are skipped.
    pub fn replay(&self) -> Result<RecoveredProgress> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RecoveredProgress::default()),
            Err(e) => return Err(e.into()),
        };

        let mut progress = RecoveredProgress::default();
        for line in content.split_inclusive('\n') {
            let Some(line) = line.strip_suffix('\n') else {
                tracing::warn!(
                    "Ignoring torn record at end of recovery log {}",
                    self.path.display()
                );
                continue;
            };
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match RecoveryEntry::parse(line) {
                Some(entry) => progress.apply(entry),
                None => tracing::warn!(
                    "Skipping malformed record in {}: {:?}",
                    self.path.display(),
                    line
                ),
            }
        }
        Ok(progress)
    }

    pub fn begin_deletions(&mut self) -> Result<()> {
        self.append(RecoveryEntry::BeginDeletions)
    }

    pub fn file_name_deleted(&mut self, path: &Path) -> Result<()> {
        self.append(RecoveryEntry::FileNameDeleted(path.to_path_buf()))
    }

    pub fn begin_files(&mut self) -> Result<()> {
        self.append(RecoveryEntry::BeginFiles)
    }

    pub fn file_synced(&mut self, path: &Path) -> Result<()> {
        self.append(RecoveryEntry::FileSynced(path.to_path_buf()))
    }

    /// Append one record and sync it to disk before returning.
    pub fn append(&mut self, entry: RecoveryEntry) -> Result<()> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)?;
                }
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?
            }
        };
        let file = self.file.insert(file);

        let mut line = entry.to_line();
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Drop the log once its content is folded into the manifest.
    pub fn clear(&mut self) -> Result<()> {
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log() -> (RecoveryLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = RecoveryLog::new(&dir.path().join("g1").join("sync.log"));
        (log, dir)
    }

    #[test]
    fn test_replay_missing_log() {
        let (log, _dir) = temp_log();
        assert!(!log.exists());
        assert!(log.replay().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_replay() {
        let (mut log, _dir) = temp_log();
        log.begin_deletions().unwrap();
        log.file_name_deleted(Path::new("/data/g1/old.tsfile")).unwrap();
        log.begin_files().unwrap();
        log.file_synced(Path::new("/data/g1/new 1.tsfile")).unwrap();

        let progress = log.replay().unwrap();
        assert!(progress.deleted.contains(Path::new("/data/g1/old.tsfile")));
        assert!(progress.synced.contains(Path::new("/data/g1/new 1.tsfile")));
        assert_eq!(progress.synced.len(), 1);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let (mut log, _dir) = temp_log();
        log.begin_files().unwrap();
        log.file_synced(Path::new("/data/g1/a.tsfile")).unwrap();
        log.file_synced(Path::new("/data/g1/a.tsfile")).unwrap();

        let first = log.replay().unwrap();
        let second = log.replay().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.synced.len(), 1);
    }

    #[test]
    fn test_torn_tail_ignored() {
        let (log, _dir) = temp_log();
        fs::create_dir_all(log.path().parent().unwrap()).unwrap();
        fs::write(
            log.path(),
            "begin-files\nfile-synced /data/g1/a.tsfile\nfile-synced /data/g1/b.ts",
        )
        .unwrap();

        let progress = log.replay().unwrap();
        assert_eq!(progress.synced.len(), 1);
        assert!(progress.synced.contains(Path::new("/data/g1/a.tsfile")));
    }

    #[test]
    fn test_malformed_records_skipped() {
        let (log, _dir) = temp_log();
        fs::create_dir_all(log.path().parent().unwrap()).unwrap();
        fs::write(log.path(), "file-synced\nunknown thing\nfile-name-deleted /x\n").unwrap();

        let progress = log.replay().unwrap();
        assert!(progress.synced.is_empty());
        assert!(progress.deleted.contains(Path::new("/x")));
    }

    #[test]
    fn test_clear() {
        let (mut log, _dir) = temp_log();
        log.begin_files().unwrap();
        assert!(log.exists());

        log.clear().unwrap();
        assert!(!log.exists());
        log.clear().unwrap();

        // Appending after a clear starts a fresh log
        log.begin_deletions().unwrap();
        assert!(log.replay().unwrap().is_empty());
        assert!(log.exists());
    }
}
