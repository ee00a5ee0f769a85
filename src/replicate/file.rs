//! Data file replication and deletion propagation for one storage group.
//!
//! Every file is sent from a snapshot, chunk by chunk, and confirmed by a
//! digest exchange. A rejected chunk or a digest mismatch restarts the file
//! from its first chunk. Confirmed steps go to the recovery log before the
//! in-memory file set is updated.

use crate::digest::ChecksumDigest;
use crate::error::{ErrorClass, Result, SyncError};
use crate::replicate::snapshot::{SnapshotFile, SnapshotKind};
use crate::replicate::GroupStats;
use crate::state::{RecoveryLog, StorageGroupFileSet};
use crate::transport::{Status, SyncService};
use bytes::Bytes;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

pub struct FileReplicator {
    chunk_size: usize,
    max_attempts: u32,
}

impl FileReplicator {
    pub fn new(chunk_size: usize, max_attempts: u32) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Tell the receiver about every deleted file still pending.
    ///
    /// A refused notice leaves that file pending and moves on; only a
    /// broken connection stops the loop.
    pub async fn sync_deletions<S>(
        &self,
        service: &mut S,
        set: &mut StorageGroupFileSet,
        log: &mut RecoveryLog,
        stats: &mut GroupStats,
    ) -> Result<()>
    where
        S: SyncService + ?Sized,
    {
        let pending = set.pending_delete();
        if pending.is_empty() {
            tracing::debug!(group = set.name(), "No deleted files to announce");
            return Ok(());
        }

        log.begin_deletions()?;
        tracing::info!(
            group = set.name(),
            "Announcing {} deleted file(s)",
            pending.len()
        );

        for path in pending {
            let name = remote_name(&path);
            match service.notify_deleted_name(&name).await? {
                Status::Success => {
                    if let Err(e) = log.file_name_deleted(&path) {
                        tracing::error!(
                            group = set.name(),
                            file = %path.display(),
                            "Cannot record deletion, it stays pending: {}",
                            e
                        );
                        stats.delete_failed += 1;
                        continue;
                    }
                    set.mark_deleted(&path);
                    stats.deleted += 1;
                }
                Status::Failure => {
                    tracing::warn!(
                        group = set.name(),
                        file = %path.display(),
                        "Receiver refused deletion notice, skipping"
                    );
                    stats.delete_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Transfer every pending new file of the group.
    ///
    /// Per-file failures are counted and logged; an error is returned only
    /// when the connection is gone.
    pub async fn sync_files<S>(
        &self,
        service: &mut S,
        set: &mut StorageGroupFileSet,
        log: &mut RecoveryLog,
        stats: &mut GroupStats,
    ) -> Result<()>
    where
        S: SyncService + ?Sized,
    {
        let pending = set.pending_sync();
        if pending.is_empty() {
            tracing::debug!(group = set.name(), "No new files to transfer");
            return Ok(());
        }

        log.begin_files()?;
        let snapshot_dir = set.paths().snapshot_dir.clone();
        let total = pending.len();

        for (index, path) in pending.into_iter().enumerate() {
            let snapshot = match SnapshotFile::create(&path, &snapshot_dir) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(
                        group = set.name(),
                        "Skipping file this cycle: {}",
                        e
                    );
                    stats.sync_failed += 1;
                    continue;
                }
            };

            if snapshot.kind() == SnapshotKind::Copy {
                tracing::info!(
                    group = set.name(),
                    file = %snapshot.source().display(),
                    "Snapshot is a full copy, source cannot be hard linked"
                );
            }

            let name = remote_name(&path);
            let result = self.transfer_with_retry(service, &snapshot, &name).await;
            if let Err(e) = snapshot.remove() {
                tracing::warn!(file = %path.display(), "Cannot remove snapshot: {}", e);
            }

            match result {
                Ok(bytes) => {
                    if let Err(e) = log.file_synced(&path) {
                        tracing::error!(
                            group = set.name(),
                            file = %path.display(),
                            "Cannot record transfer, file stays pending: {}",
                            e
                        );
                        stats.sync_failed += 1;
                        continue;
                    }
                    set.mark_synced(&path);
                    stats.synced += 1;
                    stats.bytes_sent += bytes;
                    tracing::info!(
                        group = set.name(),
                        "Transferred {} ({} bytes), {}/{}",
                        name,
                        bytes,
                        index + 1,
                        total
                    );
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        group = set.name(),
                        file = %path.display(),
                        "File stays pending: {}",
                        e
                    );
                    stats.sync_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Send the snapshot until the receiver's digest matches or the attempt
    /// budget runs out. Returns the number of bytes in the file.
    pub async fn transfer_with_retry<S>(
        &self,
        service: &mut S,
        snapshot: &SnapshotFile,
        name: &str,
    ) -> Result<u64>
    where
        S: SyncService + ?Sized,
    {
        for attempt in 1..=self.max_attempts {
            match self.try_transfer(service, snapshot.path(), name).await {
                Ok(bytes) => {
                    if attempt > 1 {
                        tracing::info!("{} confirmed on attempt {}", name, attempt);
                    }
                    return Ok(bytes);
                }
                Err(e) if e.class() == ErrorClass::Retryable => {
                    tracing::warn!(attempt, "Transfer of {} failed, restarting: {}", name, e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::AttemptsExhausted {
            unit: name.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// One attempt from the first chunk to the digest exchange.
    async fn try_transfer<S>(&self, service: &mut S, path: &Path, name: &str) -> Result<u64>
    where
        S: SyncService + ?Sized,
    {
        if service.init_transfer(name).await? == Status::Failure {
            return Err(SyncError::InitRejected(name.to_string()));
        }

        let file = File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut digest = ChecksumDigest::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut chunk = 0u64;

        loop {
            let n = read_chunk(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
            if service.send_chunk(Bytes::copy_from_slice(&buf[..n])).await? == Status::Failure {
                return Err(SyncError::ChunkRejected {
                    unit: name.to_string(),
                    chunk,
                });
            }
            chunk += 1;
        }

        let local = digest.to_hex();
        let remote = service.check_digest(&local).await?;
        if remote != local {
            return Err(SyncError::DigestMismatch {
                unit: name.to_string(),
                local,
                remote,
            });
        }
        Ok(digest.bytes())
    }
}

/// Fill `buf` completely unless the file ends first.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Name a file is known by on the receiver
pub fn remote_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
