//! Per-cycle summary, logged when a cycle ends.

use crate::replicate::{GroupStats, SchemaOutcome};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupStatus {
    /// Nothing pending; no remote calls were made.
    Idle,
    /// Every pending deletion and file was confirmed.
    Completed,
    /// Some units failed and stay pending.
    Partial,
    /// The group could not be processed this cycle.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct GroupReport {
    pub data_dir: PathBuf,
    pub name: String,
    pub status: GroupStatus,
    pub stats: GroupStats,
    /// Steps taken over from the recovery log of an unfinished cycle
    pub recovered: usize,
}

impl GroupReport {
    pub fn new(data_dir: PathBuf, name: &str) -> Self {
        Self {
            data_dir,
            name: name.to_string(),
            status: GroupStatus::Idle,
            stats: GroupStats::new(),
            recovered: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub schema: Option<SchemaOutcome>,
    pub groups: Vec<GroupReport>,
    pub duration: Duration,
}

impl CycleReport {
    pub fn group(&self, name: &str) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn files_synced(&self) -> u64 {
        self.groups.iter().map(|g| g.stats.synced).sum()
    }

    pub fn files_failed(&self) -> u64 {
        self.groups.iter().map(|g| g.stats.sync_failed).sum()
    }

    pub fn log(&self) {
        for group in &self.groups {
            if group.status == GroupStatus::Idle {
                continue;
            }
            tracing::info!(
                group = %group.name,
                data_dir = %group.data_dir.display(),
                "{:?}: {} synced, {} deleted, {} failed, {} bytes",
                group.status,
                group.stats.synced,
                group.stats.deleted,
                group.stats.sync_failed + group.stats.delete_failed,
                group.stats.bytes_sent
            );
        }
        tracing::info!(
            "Sync cycle finished in {:.1}s: {} file(s) synced, {} failed",
            self.duration.as_secs_f64(),
            self.files_synced(),
            self.files_failed()
        );
    }
}
