//! Sync cycle orchestration and scheduling.

pub mod context;
pub mod coordinator;
pub mod report;
pub mod scheduler;

pub use context::{Activity, AgentContext, BusyGuard};
pub use coordinator::{Phase, SyncCoordinator};
pub use report::{CycleReport, GroupReport, GroupStatus};
pub use scheduler::Scheduler;
