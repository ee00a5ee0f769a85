//! Transfer of schema logs and data files to the receiver.
//!
//! Both replicators retry the same way: a bounded loop that restarts the
//! whole unit from its first byte, counting attempts, and stops early on any
//! error that is not [`ErrorClass::Retryable`](crate::error::ErrorClass).

pub mod file;
pub mod schema;
pub mod snapshot;

pub use file::FileReplicator;
pub use schema::{SchemaOutcome, SchemaReplicator};
pub use snapshot::{clear_stale_snapshots, SnapshotFile, SnapshotKind};

/// Work done for one storage group in one cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub deleted: u64,
    pub delete_failed: u64,
    pub synced: u64,
    pub sync_failed: u64,
    pub bytes_sent: u64,
}

impl GroupStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_failures(&self) -> bool {
        self.delete_failed > 0 || self.sync_failed > 0
    }
}
