//! One sync cycle, start to finish.
//!
//! Phases run strictly in order over a single session:
//! connect, identify, schema, then per storage group recovery check,
//! deletions and files, and finally end-of-session bookkeeping.
//!
//! Anything fatal (lost connection, refused identity, failed schema sync)
//! aborts the rest of the cycle. Storage groups already processed still get
//! their manifests written, so confirmed work is never repeated.

use crate::error::{Result, SyncError};
use crate::replicate::{clear_stale_snapshots, FileReplicator, SchemaOutcome, SchemaReplicator};
use crate::state::{
    scan_storage_groups, GroupPaths, RecoveryLog, ScannedGroup, SchemaPosition,
    StorageGroupFileSet,
};
use crate::sync::context::AgentContext;
use crate::sync::report::{CycleReport, GroupReport, GroupStatus};
use crate::transport::{handshake, Connected, SyncService};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Identifying,
    SchemaSync,
    RecoveryCheck,
    Deletions,
    Files,
    Finalizing,
}

/// A group whose manifest and recovery log still need finalizing.
struct OpenGroup {
    set: StorageGroupFileSet,
    log: RecoveryLog,
}

pub struct SyncCoordinator {
    ctx: Arc<AgentContext>,
    phase: Phase,
}

impl SyncCoordinator {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            phase: Phase::Idle,
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Run one full cycle. Returns `Ok(None)` when another cycle is still
    /// running and this one was skipped.
    pub async fn run_cycle(&mut self) -> Result<Option<CycleReport>> {
        let ctx = Arc::clone(&self.ctx);
        let Some(_busy) = ctx.activity.try_begin() else {
            tracing::info!("Previous sync cycle still running, skipping");
            return Ok(None);
        };

        let started = Instant::now();
        let result = self.cycle(&ctx).await;
        self.enter(Phase::Idle);

        let mut report = result?;
        report.duration = started.elapsed();
        Ok(Some(report))
    }

    async fn cycle(&mut self, ctx: &AgentContext) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.enter(Phase::Connecting);
        let Connected {
            mut service,
            caller_address,
        } = ctx.connector.connect().await?;

        self.enter(Phase::Identifying);
        if let Err(e) = handshake(service.as_mut(), &caller_address).await {
            service.close().await;
            return Err(e);
        }

        self.enter(Phase::SchemaSync);
        match self.sync_schema(ctx, service.as_mut()).await {
            Ok(outcome) => report.schema = Some(outcome),
            Err(e) => {
                service.close().await;
                return Err(SyncError::Schema(Box::new(e)));
            }
        }

        let mut open_groups = Vec::new();
        let outcome = self
            .sync_data_dirs(ctx, service.as_mut(), &mut open_groups, &mut report)
            .await;

        self.enter(Phase::Finalizing);
        match &outcome {
            Ok(()) => {
                if let Err(e) = service.end_session().await {
                    tracing::warn!("End of session not acknowledged: {}", e);
                }
            }
            Err(e) => tracing::error!("Sync cycle aborted: {}", e),
        }
        service.close().await;

        for group in &mut open_groups {
            finalize_group(group);
        }
        outcome.map(|()| report)
    }

    async fn sync_schema(
        &self,
        ctx: &AgentContext,
        service: &mut dyn SyncService,
    ) -> Result<SchemaOutcome> {
        let config = &ctx.config;
        let mut position = SchemaPosition::load(&config.schema_pos_path())?;
        SchemaReplicator::new(
            &config.schema_log,
            config.schema_batch_lines,
            config.max_attempts,
        )
        .sync(service, &mut position)
        .await
    }

    async fn sync_data_dirs(
        &mut self,
        ctx: &AgentContext,
        service: &mut dyn SyncService,
        open_groups: &mut Vec<OpenGroup>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let config = &ctx.config;
        for data_dir in &config.data_dirs {
            let groups = match scan_storage_groups(data_dir, config) {
                Ok(groups) => groups,
                Err(e) => {
                    tracing::error!("Cannot scan data dir {}: {}", data_dir.display(), e);
                    continue;
                }
            };
            let state_dir = config.state_dir(data_dir);

            for group in groups {
                if ctx.activity.stop_requested() {
                    tracing::info!("Stop requested, leaving remaining storage groups");
                    return Ok(());
                }

                let mut group_report = GroupReport::new(data_dir.clone(), &group.name);
                let result = self
                    .sync_group(ctx, service, &state_dir, group, open_groups, &mut group_report)
                    .await;
                report.groups.push(group_report);
                result?;
            }
        }
        Ok(())
    }

    /// Process one storage group. Only fatal errors are returned; anything
    /// scoped to the group is recorded in `group_report`.
    async fn sync_group(
        &mut self,
        ctx: &AgentContext,
        service: &mut dyn SyncService,
        state_dir: &Path,
        group: ScannedGroup,
        open_groups: &mut Vec<OpenGroup>,
        group_report: &mut GroupReport,
    ) -> Result<()> {
        let config = &ctx.config;
        let name = group.name.clone();

        self.enter(Phase::RecoveryCheck);
        let (mut set, mut log) = match recover_group(state_dir, group) {
            Ok((set, log, recovered)) => {
                group_report.recovered = recovered;
                (set, log)
            }
            Err(e) => {
                tracing::error!(group = %name, "Cannot load group state: {}", e);
                group_report.status = GroupStatus::Failed(e.to_string());
                return Ok(());
            }
        };

        if set.is_idle() {
            tracing::debug!(group = %name, "Storage group up to date");
            return Ok(());
        }

        tracing::info!(
            group = %name,
            "{} known file(s), {} new, {} deleted",
            set.last_known().len(),
            set.to_sync().len(),
            set.to_delete().len()
        );
        if !service.start_storage_group(&name).await?.is_success() {
            let e = SyncError::Refused {
                operation: "startStorageGroup",
                unit: name,
            };
            tracing::warn!("{}, skipping group", e);
            group_report.status = GroupStatus::Failed(e.to_string());
            return Ok(());
        }

        let replicator = FileReplicator::new(config.chunk_size, config.max_attempts);
        let stats = &mut group_report.stats;

        self.enter(Phase::Deletions);
        let mut result = replicator
            .sync_deletions(&mut *service, &mut set, &mut log, stats)
            .await;

        if result.is_ok() {
            self.enter(Phase::Files);
            result = replicator
                .sync_files(&mut *service, &mut set, &mut log, stats)
                .await;
        }

        // Whatever happened, confirmed steps go into the manifest at the end.
        open_groups.push(OpenGroup { set, log });

        match result {
            Ok(()) if stats.has_failures() => group_report.status = GroupStatus::Partial,
            Ok(()) => group_report.status = GroupStatus::Completed,
            Err(e) if e.is_fatal() => {
                group_report.status = GroupStatus::Failed(e.to_string());
                return Err(e);
            }
            Err(e) => {
                tracing::error!(group = %name, "Storage group sync failed: {}", e);
                group_report.status = GroupStatus::Failed(e.to_string());
            }
        }
        Ok(())
    }
}

/// Load the group's state and fold in whatever an interrupted cycle left
/// behind. Returns the number of recovered steps.
fn recover_group(
    state_dir: &Path,
    group: ScannedGroup,
) -> Result<(StorageGroupFileSet, RecoveryLog, usize)> {
    let paths = GroupPaths::new(state_dir, &group.name);
    let mut set = StorageGroupFileSet::open(&group.name, paths.clone(), group.files)?;
    let mut log = RecoveryLog::new(&paths.recovery_log);

    let mut recovered = 0;
    if log.exists() {
        let progress = log.replay()?;
        recovered = progress.deleted.len() + progress.synced.len();
        if !progress.is_empty() {
            tracing::info!(
                group = %group.name,
                "Recovered {} confirmed step(s) from unfinished cycle",
                recovered
            );
            set.absorb(&progress);
        }
        // Manifest first; the log goes only once its content is durable.
        set.persist()?;
        log.clear()?;
    }

    if let Err(e) = clear_stale_snapshots(&paths.snapshot_dir) {
        tracing::warn!(group = %group.name, "Cannot clear snapshots: {}", e);
    }

    Ok((set, log, recovered))
}

/// Write the manifest, then drop the recovery log. If the manifest cannot be
/// written the log stays, and the next cycle recovers from it.
fn finalize_group(group: &mut OpenGroup) {
    let name = group.set.name().to_string();
    if let Err(e) = group.set.persist() {
        tracing::error!(group = %name, "Cannot write manifest, keeping recovery log: {}", e);
        return;
    }
    if let Err(e) = group.log.clear() {
        tracing::warn!(
            group = %name,
            "Cannot remove recovery log {}: {}",
            group.log.path().display(),
            e
        );
    }
}
