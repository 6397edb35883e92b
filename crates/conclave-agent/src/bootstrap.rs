use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conclave_core::config::AppConfig;
use conclave_core::error::Result;
use conclave_core::progress::ProgressBus;
use conclave_core::types::{new_id, RunStatus, StepStatus};
use conclave_store::{LeaseStore, Stores, EXECUTION_LEASE, PROCESS_LOST};

use crate::backends::BackendRegistry;
use crate::handles::InMemoryHandles;
use crate::launcher::AgentLauncher;
use crate::logs::InMemoryLogBuffer;
use crate::run_log::RunLogger;
use crate::team::{MarkerExtractor, ToolRegistry, ToolServer, TeamSupervisor};
use crate::triggers::WorkflowScheduler;
use crate::workflow::WorkflowEngine;

/// How long an unrenewed execution lease stays valid.
const LEASE_TTL: Duration = Duration::from_secs(30);
const LEASE_RENEW_EVERY: Duration = Duration::from_secs(10);

/// Every service of one process, wired to a shared database and progress bus.
#[derive(Clone)]
pub struct Conclave {
    pub config: AppConfig,
    pub stores: Stores,
    pub progress: Arc<ProgressBus>,
    pub launcher: AgentLauncher,
    pub engine: WorkflowEngine,
    pub teams: TeamSupervisor,
    pub tools: ToolServer,
}

impl Conclave {
    /// Open the database at the configured path. Nothing stored is touched:
    /// recovery belongs to whichever process claims execution.
    pub fn open(config: AppConfig, backends: BackendRegistry) -> Result<Self> {
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stores = Stores::open(&db_path)?;
        info!(path = %db_path.display(), "Database opened");
        Self::with_stores(config, stores, backends)
    }

    /// Wire services around existing stores.
    pub fn with_stores(config: AppConfig, stores: Stores, backends: BackendRegistry) -> Result<Self> {
        let progress = Arc::new(ProgressBus::default());
        let launcher = AgentLauncher::new(
            stores.agents.clone(),
            stores.traces.clone(),
            Arc::new(backends),
            Arc::new(InMemoryHandles::new()),
            Arc::new(InMemoryLogBuffer::new(config.launcher.log_buffer_lines)),
            progress.clone(),
        );
        let engine = WorkflowEngine::new(
            stores.workflows.clone(),
            launcher.clone(),
            progress.clone(),
            Duration::from_secs(config.workflow.default_step_timeout_secs),
        );
        let teams = TeamSupervisor::new(
            stores.teams.clone(),
            stores.events.clone(),
            stores.blackboard.clone(),
            launcher.clone(),
            Arc::new(MarkerExtractor),
            progress.clone(),
        );
        let tools = ToolServer::new(
            Arc::new(ToolRegistry::with_coordination_tools()),
            stores.clone(),
        );

        Ok(Self {
            config,
            stores,
            progress,
            launcher,
            engine,
            teams,
            tools,
        })
    }

    /// Become the process that owns execution.
    ///
    /// Succeeds when no other live process holds the execution lease; the
    /// previous owner's running agents and runs are then recovered as lost.
    /// Returns `None`, touching nothing, while another owner is alive.
    pub fn claim_execution(&self) -> Result<Option<ExecutionLease>> {
        let holder = new_id();
        let leases = &self.stores.leases;
        if !leases.acquire(EXECUTION_LEASE, &holder, LEASE_TTL)? {
            let owner = leases.holder(EXECUTION_LEASE)?.unwrap_or_default();
            info!(owner = %owner, "Execution is owned by another process, skipping recovery");
            return Ok(None);
        }
        if let Err(e) = recover(&self.stores) {
            leases.release(EXECUTION_LEASE, &holder).ok();
            return Err(e);
        }

        let keeper = CancellationToken::new();
        tokio::spawn(keep_lease(
            self.stores.leases.clone(),
            holder.clone(),
            keeper.clone(),
        ));
        debug!(holder = %holder, "Execution lease acquired");
        Ok(Some(ExecutionLease {
            leases: self.stores.leases.clone(),
            holder,
            keeper,
        }))
    }

    /// Trigger scheduler for this process, stopped by `cancel`.
    pub fn scheduler(&self, cancel: CancellationToken) -> WorkflowScheduler {
        WorkflowScheduler::new(
            self.engine.clone(),
            self.stores.events.clone(),
            Duration::from_secs(self.config.triggers.event_poll_interval_secs.max(1)),
            cancel,
        )
    }

    /// Start the JSONL run logger when logging is enabled.
    pub fn spawn_run_logger(&self, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.log.enabled {
            return None;
        }
        let logger = RunLogger::new(self.config.log_dir(), self.config.log.level);
        let progress = self.progress.clone();
        Some(tokio::spawn(async move {
            logger.run(&progress, cancel).await;
        }))
    }
}

/// Ownership of execution for as long as it is held. Dropping it stops the
/// renewals and frees the lease for the next process.
pub struct ExecutionLease {
    leases: LeaseStore,
    holder: String,
    keeper: CancellationToken,
}

impl ExecutionLease {
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        self.keeper.cancel();
        if let Err(e) = self.leases.release(EXECUTION_LEASE, &self.holder) {
            warn!(error = %e, "Failed to release execution lease");
        }
    }
}

async fn keep_lease(leases: LeaseStore, holder: String, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(LEASE_RENEW_EVERY) => {}
        }
        match leases.renew(EXECUTION_LEASE, &holder, LEASE_TTL) {
            Ok(true) => {}
            Ok(false) => {
                warn!(holder = %holder, "Execution lease was taken over");
                return;
            }
            Err(e) => warn!(error = %e, "Failed to renew execution lease"),
        }
    }
}

/// Agents marked running and runs marked running cannot survive their owner.
fn recover(stores: &Stores) -> Result<()> {
    stores.agents.recover_stale_instances()?;

    let runs = stores.workflows.interrupted_runs()?;
    for mut run in runs {
        let now = Utc::now();
        for result in run.step_results.values_mut() {
            if result.status == StepStatus::Running {
                result.status = StepStatus::Error;
                result.error = Some(PROCESS_LOST.to_string());
                result.completed_at = Some(now);
            }
        }
        run.status = RunStatus::Error;
        run.completed_at = Some(now);
        stores.workflows.save_run(&run)?;
        stores.workflows.record_last_run(&run.workflow_id, &run)?;
        warn!(run_id = %run.id, workflow_id = %run.workflow_id, "Marked interrupted run as error");
    }
    Ok(())
}
