//! Error types for the sync sender.
//!
//! Every error carries an [`ErrorClass`] so callers decide between aborting the
//! cycle, retrying the unit, or skipping it, without matching on variants.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// How far an error is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Aborts the current cycle (or the process, for identity rejection).
    Fatal,
    /// The unit may be restarted from scratch within its attempt budget.
    Retryable,
    /// Only the current file, deletion or group fails; siblings proceed.
    PerUnitFailure,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Cannot connect to receiver {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to receiver lost: {0}")]
    Connection(String),

    #[error("Receiver rejected sender identity {0}")]
    IdentityRejected(String),

    #[error("Receiver refused to start transfer of {0}")]
    InitRejected(String),

    #[error("Receiver rejected chunk {chunk} of {unit}")]
    ChunkRejected { unit: String, chunk: u64 },

    #[error("Digest mismatch for {unit}: local {local}, remote {remote}")]
    DigestMismatch {
        unit: String,
        local: String,
        remote: String,
    },

    #[error("Gave up on {unit} after {attempts} attempts")]
    AttemptsExhausted { unit: String, attempts: u32 },

    #[error("Receiver refused {operation} for {unit}")]
    Refused { operation: &'static str, unit: String },

    #[error("Cannot create snapshot of {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Schema sync failed: {0}")]
    Schema(Box<SyncError>),

    #[error("Another sender instance holds lock {0}")]
    AlreadyRunning(PathBuf),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Connect { .. }
            | SyncError::Connection(_)
            | SyncError::IdentityRejected(_)
            | SyncError::Schema(_)
            | SyncError::AlreadyRunning(_)
            | SyncError::Protocol(_) => ErrorClass::Fatal,
            SyncError::InitRejected(_)
            | SyncError::ChunkRejected { .. }
            | SyncError::DigestMismatch { .. } => ErrorClass::Retryable,
            SyncError::AttemptsExhausted { .. }
            | SyncError::Refused { .. }
            | SyncError::Snapshot { .. }
            | SyncError::Io(_) => ErrorClass::PerUnitFailure,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Identity rejection stops the whole agent rather than just the cycle.
    pub fn stops_agent(&self) -> bool {
        matches!(
            self,
            SyncError::IdentityRejected(_) | SyncError::AlreadyRunning(_)
        )
    }

    /// Wrap a transport failure raised by the remote stub.
    pub fn connection(err: impl std::fmt::Display) -> Self {
        SyncError::Connection(format!("{:#}", err))
    }
}
