//! tsync - sender side of a one-way time-series data replicator.
//!
//! A sender periodically pushes newly closed data files and the schema log of
//! a local database to a remote receiver, announces files that disappeared
//! locally, and records enough state to resume after a crash without
//! resending confirmed work.

pub mod config;
pub mod digest;
pub mod error;
pub mod lock;
pub mod protocol;
pub mod replicate;
pub mod state;
pub mod sync;
pub mod transport;

pub use config::AgentConfig;
pub use error::{ErrorClass, Result, SyncError};
pub use sync::{AgentContext, CycleReport, Scheduler, SyncCoordinator};
