//! Agent context - built once at startup and handed to every component.

use crate::config::AgentConfig;
use crate::transport::{Connector, TcpConnector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flags between the coordinator, the scheduler and the monitor.
///
/// Only the coordinator writes `busy`; the monitor only reads it.
#[derive(Debug, Clone, Default)]
pub struct Activity {
    busy: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
}

impl Activity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a cycle as running. `None` if one already is.
    pub fn try_begin(&self) -> Option<BusyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Ask a running cycle to stop at the next storage group boundary.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// Clears the busy flag when the cycle ends, however it ends.
#[derive(Debug)]
pub struct BusyGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct AgentContext {
    pub config: AgentConfig,
    pub connector: Arc<dyn Connector>,
    pub activity: Activity,
}

impl AgentContext {
    /// Context talking TCP to the configured receiver.
    pub fn new(config: AgentConfig) -> Self {
        let connector = TcpConnector::new(config.server_addr(), config.call_timeout());
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: AgentConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            activity: Activity::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_guard() {
        let activity = Activity::new();
        assert!(!activity.is_busy());

        let guard = activity.try_begin().unwrap();
        assert!(activity.is_busy());
        assert!(activity.try_begin().is_none());

        drop(guard);
        assert!(!activity.is_busy());
        assert!(activity.try_begin().is_some());
    }

    #[test]
    fn test_stop_request_visible_to_clones() {
        let activity = Activity::new();
        let monitor_view = activity.clone();
        activity.request_stop();
        assert!(monitor_view.stop_requested());
    }
}
