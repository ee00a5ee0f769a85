//! Schema log replication.
//!
//! Lines past the confirmed [`SchemaPosition`] are sent in fixed-size line
//! batches. The digest covers the whole region of one attempt; a mismatch
//! resends the whole region from the same starting position.

use crate::config::SCHEMA_LOG_NAME;
use crate::digest::ChecksumDigest;
use crate::error::{ErrorClass, Result, SyncError};
use crate::state::SchemaPosition;
use crate::transport::{Status, SyncService};
use bytes::{Bytes, BytesMut};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Result of one schema sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    /// The receiver already had every complete line.
    UpToDate { position: u64 },
    /// `lines` new lines confirmed; the position moved from `from` to `to`.
    Synced {
        from: u64,
        to: u64,
        lines: u64,
        attempts: u32,
    },
}

pub struct SchemaReplicator {
    schema_log: PathBuf,
    batch_lines: usize,
    max_attempts: u32,
}

impl SchemaReplicator {
    pub fn new(schema_log: &Path, batch_lines: usize, max_attempts: u32) -> Self {
        Self {
            schema_log: schema_log.to_path_buf(),
            batch_lines: batch_lines.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Send unconfirmed schema lines and advance `position` once the
    /// receiver's digest matches.
    pub async fn sync<S>(
        &self,
        service: &mut S,
        position: &mut SchemaPosition,
    ) -> Result<SchemaOutcome>
    where
        S: SyncService + ?Sized,
    {
        let start = position.lines();
        let available = match count_complete_lines(&self.schema_log).await {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("Schema log {} does not exist yet", self.schema_log.display());
                0
            }
            Err(e) => return Err(e.into()),
        };

        if available <= start {
            if available < start {
                tracing::warn!(
                    "Schema log {} has {} lines but {} are confirmed, nothing to send",
                    self.schema_log.display(),
                    available,
                    start
                );
            }
            return Ok(SchemaOutcome::UpToDate { position: start });
        }

        for attempt in 1..=self.max_attempts {
            match self.try_sync(service, start).await {
                Ok(lines) => {
                    let to = start + lines;
                    position.advance(to)?;
                    tracing::info!(
                        "Receiver confirmed schema lines {}..{} ({} attempt(s))",
                        start,
                        to,
                        attempt
                    );
                    return Ok(SchemaOutcome::Synced {
                        from: start,
                        to,
                        lines,
                        attempts: attempt,
                    });
                }
                Err(e) if e.class() == ErrorClass::Retryable => {
                    tracing::warn!(attempt, "Schema transfer failed, retrying: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::AttemptsExhausted {
            unit: SCHEMA_LOG_NAME.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// One full attempt: returns the number of lines the receiver confirmed.
    async fn try_sync<S>(&self, service: &mut S, start: u64) -> Result<u64>
    where
        S: SyncService + ?Sized,
    {
        if service.init_transfer(SCHEMA_LOG_NAME).await? == Status::Failure {
            return Err(SyncError::InitRejected(SCHEMA_LOG_NAME.to_string()));
        }

        let mut reader = BufReader::new(File::open(&self.schema_log).await?);
        let mut line = Vec::new();
        let mut skipped = 0u64;
        while skipped < start {
            line.clear();
            if !read_complete_line(&mut reader, &mut line).await? {
                break;
            }
            skipped += 1;
        }

        let mut digest = ChecksumDigest::new();
        let mut batch = BytesMut::new();
        let mut batch_count = 0usize;
        let mut sent = 0u64;
        let mut batches = 0u64;

        loop {
            line.clear();
            if !read_complete_line(&mut reader, &mut line).await? {
                break;
            }
            digest.update(&line);
            batch.extend_from_slice(&line);
            batch_count += 1;
            sent += 1;

            if batch_count == self.batch_lines {
                self.send_batch(service, batch.split().freeze(), batches).await?;
                batches += 1;
                batch_count = 0;
            }
        }
        if batch_count > 0 {
            self.send_batch(service, batch.split().freeze(), batches).await?;
        }

        let local = digest.to_hex();
        let remote = service.check_digest(&local).await?;
        if remote != local {
            return Err(SyncError::DigestMismatch {
                unit: SCHEMA_LOG_NAME.to_string(),
                local,
                remote,
            });
        }
        Ok(sent)
    }

    async fn send_batch<S>(&self, service: &mut S, data: Bytes, index: u64) -> Result<()>
    where
        S: SyncService + ?Sized,
    {
        tracing::debug!(batch = index, bytes = data.len(), "Sending schema batch");
        match service.send_chunk(data).await? {
            Status::Success => Ok(()),
            Status::Failure => Err(SyncError::ChunkRejected {
                unit: SCHEMA_LOG_NAME.to_string(),
                chunk: index,
            }),
        }
    }
}

/// Read one newline-terminated line into `buf`. A trailing line without a
/// newline is still being written and is left for a later cycle.
async fn read_complete_line(reader: &mut BufReader<File>, buf: &mut Vec<u8>) -> io::Result<bool> {
    let n = reader.read_until(b'\n', buf).await?;
    Ok(n > 0 && buf.last() == Some(&b'\n'))
}

async fn count_complete_lines(path: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut line = Vec::new();
    let mut count = 0u64;
    loop {
        line.clear();
        if !read_complete_line(&mut reader, &mut line).await? {
            return Ok(count);
        }
        count += 1;
    }
}
