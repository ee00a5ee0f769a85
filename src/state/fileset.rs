// Storage group file sets
//
// Tracks, per storage group, which data files the receiver is known to hold
// (the manifest written at the end of the last cycle) and derives the work of
// the current cycle from a scan of the group directory.
//
// Manifest format: header comments followed by one file path per line.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::state::recovery::RecoveredProgress;
use crate::state::write_atomic;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Where one storage group keeps its sender state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPaths {
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub recovery_log: PathBuf,
    pub snapshot_dir: PathBuf,
}

impl GroupPaths {
    pub fn new(state_dir: &Path, group: &str) -> Self {
        let dir = state_dir.join(group);
        Self {
            manifest: dir.join("last_local_files.txt"),
            recovery_log: dir.join("sync.log"),
            snapshot_dir: dir.join("snapshot"),
            dir,
        }
    }
}

/// A storage group directory and the closed data files found in it.
#[derive(Debug, Clone)]
pub struct ScannedGroup {
    pub name: String,
    pub files: BTreeSet<PathBuf>,
}

/// List storage groups (sub-directories) of `data_dir` and their closed files.
///
/// Hidden entries, the sender's own state directory and files that are
/// still being written are ignored. A group whose directory is gone but
/// whose manifest is still in the state directory is listed with no files,
/// so everything it last held is announced as deleted.
pub fn scan_storage_groups(data_dir: &Path, config: &AgentConfig) -> Result<Vec<ScannedGroup>> {
    let mut groups = BTreeMap::new();
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!("Data dir {} does not exist", data_dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = storable_name(&path) else {
            continue;
        };
        if name.starts_with('.') || name == config.state_dir_name {
            continue;
        }
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let mut files = BTreeSet::new();
        for file in fs::read_dir(&path)? {
            let file = file?;
            let file_path = file.path();
            let Some(file_name) = storable_name(&file_path) else {
                continue;
            };
            if file_name.starts_with('.') || config.is_open_file(file_name) {
                continue;
            }
            if file.file_type()?.is_file() {
                files.insert(file_path);
            }
        }
        groups.insert(name.to_string(), files);
    }

    for name in vanished_groups(&config.state_dir(data_dir), &groups)? {
        tracing::info!("Storage group {} was removed, its files will be deleted", name);
        groups.insert(name, BTreeSet::new());
    }

    Ok(groups
        .into_iter()
        .map(|(name, files)| ScannedGroup { name, files })
        .collect())
}

/// Groups that still have a manifest but no directory in the data dir.
fn vanished_groups(
    state_dir: &Path,
    present: &BTreeMap<String, BTreeSet<PathBuf>>,
) -> Result<Vec<String>> {
    let entries = match fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut vanished = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') || present.contains_key(&name) {
            continue;
        }
        if !entry.file_type()?.is_dir() {
            continue;
        }
        // Nothing left to announce once every deletion was confirmed.
        let manifest = GroupPaths::new(state_dir, &name).manifest;
        if !load_manifest(&manifest)?.is_empty() {
            vanished.push(name);
        }
    }
    Ok(vanished)
}

/// File name of `path` if the whole path survives the line-per-path state
/// files unchanged. Anything else is skipped with a warning.
fn storable_name(path: &Path) -> Option<&str> {
    let storable = path
        .to_str()
        .filter(|p| !p.contains(['\n', '\r']))
        .and_then(|_| path.file_name())
        .and_then(|name| name.to_str());
    if storable.is_none() {
        tracing::warn!(
            "Skipping {:?}: name is not UTF-8 or contains a line break",
            path
        );
    }
    storable
}

/// Bookkeeping for one storage group across one cycle.
///
/// At finalization the manifest becomes
/// `(last_known ∪ succeeded_sync) \ succeeded_delete`; anything pending but
/// not succeeded is derived again on the next cycle.
#[derive(Debug)]
pub struct StorageGroupFileSet {
    name: String,
    paths: GroupPaths,
    current: BTreeSet<PathBuf>,
    last_known: BTreeSet<PathBuf>,
    to_sync: BTreeSet<PathBuf>,
    to_delete: BTreeSet<PathBuf>,
    succeeded_sync: BTreeSet<PathBuf>,
    succeeded_delete: BTreeSet<PathBuf>,
}

impl StorageGroupFileSet {
    /// Load the manifest and diff it against the files currently on disk.
    pub fn open(name: &str, paths: GroupPaths, current: BTreeSet<PathBuf>) -> Result<Self> {
        let last_known = load_manifest(&paths.manifest)?;
        let mut set = Self {
            name: name.to_string(),
            paths,
            current,
            last_known,
            to_sync: BTreeSet::new(),
            to_delete: BTreeSet::new(),
            succeeded_sync: BTreeSet::new(),
            succeeded_delete: BTreeSet::new(),
        };
        set.rediff();
        Ok(set)
    }

    fn rediff(&mut self) {
        self.to_sync = self.current.difference(&self.last_known).cloned().collect();
        self.to_delete = self.last_known.difference(&self.current).cloned().collect();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> &GroupPaths {
        &self.paths
    }

    pub fn last_known(&self) -> &BTreeSet<PathBuf> {
        &self.last_known
    }

    pub fn to_sync(&self) -> &BTreeSet<PathBuf> {
        &self.to_sync
    }

    pub fn to_delete(&self) -> &BTreeSet<PathBuf> {
        &self.to_delete
    }

    /// Nothing to send or delete this cycle.
    pub fn is_idle(&self) -> bool {
        self.to_sync.is_empty() && self.to_delete.is_empty()
    }

    /// Files still waiting for transfer, in stable order.
    pub fn pending_sync(&self) -> Vec<PathBuf> {
        self.to_sync
            .difference(&self.succeeded_sync)
            .cloned()
            .collect()
    }

    /// Deleted files whose names the receiver has not been told yet.
    pub fn pending_delete(&self) -> Vec<PathBuf> {
        self.to_delete
            .difference(&self.succeeded_delete)
            .cloned()
            .collect()
    }

    /// Returns false if the file was already recorded.
    pub fn mark_synced(&mut self, path: &Path) -> bool {
        self.succeeded_sync.insert(path.to_path_buf())
    }

    pub fn mark_deleted(&mut self, path: &Path) -> bool {
        self.succeeded_delete.insert(path.to_path_buf())
    }

    /// Fold steps confirmed by an unfinished earlier cycle into the manifest
    /// and recompute pending work so they are not repeated.
    pub fn absorb(&mut self, progress: &RecoveredProgress) {
        self.last_known.extend(progress.synced.iter().cloned());
        for path in &progress.deleted {
            self.last_known.remove(path);
        }
        self.rediff();
    }

    /// Manifest content after this cycle
    pub fn next_last_known(&self) -> BTreeSet<PathBuf> {
        self.last_known
            .union(&self.succeeded_sync)
            .filter(|p| !self.succeeded_delete.contains(*p))
            .cloned()
            .collect()
    }

    /// Durably write the manifest and roll the accumulators into it.
    pub fn persist(&mut self) -> Result<()> {
        let next = self.next_last_known();
        save_manifest(&self.paths.manifest, &self.name, &next)?;
        self.last_known = next;
        self.succeeded_sync.clear();
        self.succeeded_delete.clear();
        self.rediff();
        Ok(())
    }
}

fn load_manifest(path: &Path) -> Result<BTreeSet<PathBuf>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e.into()),
    };

    Ok(content
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

fn save_manifest(path: &Path, group: &str, files: &BTreeSet<PathBuf>) -> io::Result<()> {
    write_atomic(path, |file| {
        writeln!(file, "# tsync last local files v1")?;
        writeln!(file, "# storage_group: {}", group)?;
        writeln!(file, "# written: {}", chrono::Utc::now().to_rfc3339())?;
        for path in files {
            writeln!(file, "{}", path.display())?;
        }
        Ok(())
    })
}
