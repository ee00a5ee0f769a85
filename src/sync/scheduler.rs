//! Periodic driver of sync cycles plus the status monitor.
//!
//! The cycle timer hands ticks to a single worker over a channel and waits
//! until that cycle is done before sleeping again, so there is a fixed delay
//! between the end of one cycle and the start of the next. The monitor ticks
//! on its own and only reads the busy flag.

use crate::error::{Result, SyncError};
use crate::sync::context::{Activity, AgentContext};
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::report::CycleReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Ask the worker to run one cycle; it answers on `done` when finished.
struct Tick {
    done: oneshot::Sender<()>,
}

pub struct Scheduler {
    ctx: Arc<AgentContext>,
}

impl Scheduler {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Run one cycle right away and return its report.
    pub async fn run_once(&self) -> Result<Option<CycleReport>> {
        let mut coordinator = SyncCoordinator::new(Arc::clone(&self.ctx));
        let report = coordinator.run_cycle().await?;
        if let Some(report) = &report {
            report.log();
        }
        Ok(report)
    }

    /// Run cycles until `shutdown` flips to true or the receiver rejects
    /// this sender. A cycle in progress at shutdown finishes its current
    /// storage group first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = &self.ctx.config;
        tracing::info!(
            "Sync sender started: receiver {}, period {}s",
            config.server_addr(),
            config.sync_period_in_second
        );

        let (tick_tx, tick_rx) = mpsc::channel(1);
        let timer = spawn_timer(tick_tx, config.sync_period());
        let monitor = spawn_monitor(
            self.ctx.activity.clone(),
            config.server_addr(),
            config.monitor_period(),
        );

        let watch_stop = {
            let activity = self.ctx.activity.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                if shutdown.wait_for(|stop| *stop).await.is_ok() {
                    activity.request_stop();
                }
            })
        };

        let result = self.worker(tick_rx, &mut shutdown).await;

        timer.abort();
        monitor.abort();
        watch_stop.abort();
        tracing::info!("Sync sender stopped");
        result
    }

    async fn worker(
        &self,
        mut ticks: mpsc::Receiver<Tick>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut coordinator = SyncCoordinator::new(Arc::clone(&self.ctx));
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let tick = tokio::select! {
                tick = ticks.recv() => match tick {
                    Some(tick) => tick,
                    None => return Ok(()),
                },
                changed = shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => return Ok(()),
                },
            };

            let result = coordinator.run_cycle().await;
            let _ = tick.done.send(());
            match result {
                Ok(Some(report)) => report.log(),
                Ok(None) => {}
                Err(e) if e.stops_agent() => {
                    tracing::error!("Stopping sync sender: {}", e);
                    return Err(e);
                }
                Err(e) => log_cycle_error(&e),
            }
        }
    }
}

fn log_cycle_error(e: &SyncError) {
    if e.is_fatal() {
        tracing::error!("Sync cycle failed, retrying next period: {}", e);
    } else {
        tracing::warn!("Sync cycle finished with errors: {}", e);
    }
}

/// First tick fires immediately; later ones `period` after the previous cycle
/// completed.
fn spawn_timer(ticks: mpsc::Sender<Tick>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (done, finished) = oneshot::channel();
            if ticks.send(Tick { done }).await.is_err() {
                return;
            }
            // Dropped sender means the worker went away mid-cycle.
            let _ = finished.await;
            tokio::time::sleep(period).await;
        }
    })
}

fn spawn_monitor(activity: Activity, receiver: String, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if activity.is_busy() {
                tracing::info!("Sync to receiver {} is in progress", receiver);
            }
        }
    })
}
