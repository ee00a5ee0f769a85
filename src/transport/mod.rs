//! Remote call surface of the receiver.
//!
//! The coordinator and the replicators only talk to a [`SyncService`]; the
//! TCP implementation lives in [`session`].

pub mod session;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use session::{handshake, ConnectionSession, TcpConnector};

/// Outcome of a remote call that only acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl From<bool> for Status {
    fn from(ok: bool) -> Self {
        if ok {
            Status::Success
        } else {
            Status::Failure
        }
    }
}

/// One call at a time; every method waits for the receiver's answer.
///
/// `Err` means the transport itself broke (a connection error). A receiver
/// that answered but refused is reported as [`Status::Failure`].
#[async_trait]
pub trait SyncService: Send {
    async fn check_identity(&mut self, caller_address: &str) -> Result<Status>;

    /// Announce the storage group whose deletions and files follow.
    async fn start_storage_group(&mut self, name: &str) -> Result<Status>;

    /// Begin (or restart) receiving the unit called `name`, discarding any
    /// partial data previously received under that name.
    async fn init_transfer(&mut self, name: &str) -> Result<Status>;

    async fn send_chunk(&mut self, data: Bytes) -> Result<Status>;

    /// Returns the receiver's digest of everything received since the last
    /// `init_transfer`.
    async fn check_digest(&mut self, local_digest: &str) -> Result<String>;

    async fn notify_deleted_name(&mut self, name: &str) -> Result<Status>;

    async fn end_session(&mut self) -> Result<()>;

    /// Release the transport. Local only; nothing is sent.
    async fn close(&mut self) {}
}

/// A freshly opened session and the address to identify as.
pub struct Connected {
    pub service: Box<dyn SyncService>,
    pub caller_address: String,
}

/// Opens one session per cycle.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connected>;
}
