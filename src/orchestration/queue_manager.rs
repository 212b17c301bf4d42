//! The queue manager.
//!
//! Top-level orchestrator and the single process-wide coordination point:
//! owns the topology snapshot, bookkeeping, the host pool and the poller.
//! Control operations take `&mut self`, so the non-reentrancy contract on
//! start/stop/kill is enforced by the borrow checker rather than by
//! convention.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::execution::events::HostEventSink;
use crate::execution::host::WorkloadFactory;
use crate::execution::pool::ExecutionHostPool;
use crate::models::JobStatus;
use crate::orchestration::bookkeeping::Bookkeeping;
use crate::orchestration::context::SchedulerContext;
use crate::orchestration::poller::Poller;
use crate::orchestration::recovery;
use crate::registry::client::JobRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownMode {
    /// Checkpoint in-flight jobs so they can resume later.
    Persist,
    /// Let in-flight jobs run to natural completion within the timeout.
    Drain,
    /// Cancel everything.
    Kill,
}

pub struct QueueManager {
    config: SchedulerConfig,
    registry: Arc<dyn JobRegistry>,
    factory: Arc<dyn WorkloadFactory>,
    instance_id: Uuid,
    ctx: Option<Arc<SchedulerContext>>,
    poller: Option<Poller>,
}

impl QueueManager {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<dyn JobRegistry>,
        factory: Arc<dyn WorkloadFactory>,
    ) -> Self {
        Self {
            config,
            registry,
            factory,
            instance_id: Uuid::new_v4(),
            ctx: None,
            poller: None,
        }
    }

    /// Identity of this scheduler instance; owner of its registry locks.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The running context, for inspection. `None` before start and after
    /// shutdown.
    pub fn context(&self) -> Option<Arc<SchedulerContext>> {
        self.ctx.clone()
    }

    /// Start the scheduler: sanity-check configuration, load the cluster
    /// topology, reconcile interrupted jobs, then begin polling. Errors
    /// here are fatal: the scheduler must not enter service half-built.
    pub async fn start(&mut self, interactive: bool) -> Result<()> {
        if self.ctx.is_some() {
            return Err(SchedulerError::InvalidOperation(
                "scheduler has already been started".to_string(),
            ));
        }

        self.config.sanity_check()?;

        info!(
            cluster = %self.config.cluster_name,
            instance_id = %self.instance_id,
            user_account = %process_user(),
            interactive,
            "Scheduler service is starting"
        );

        let topology = self
            .registry
            .load_cluster(&self.config.cluster_name, self.config.layout_required)
            .await?;
        info!(
            queues = topology.queues.len(),
            machines = topology.machines.len(),
            "Cluster topology loaded"
        );

        let bookkeeping = Arc::new(Bookkeeping::new(topology.queue_ids()));
        let sink: Arc<dyn HostEventSink> = Arc::clone(&bookkeeping) as Arc<dyn HostEventSink>;
        let pool = ExecutionHostPool::new(Arc::clone(&self.factory), sink);

        let ctx = Arc::new(SchedulerContext {
            config: self.config.clone(),
            instance_id: self.instance_id,
            interactive,
            registry: Arc::clone(&self.registry),
            topology,
            bookkeeping,
            pool,
        });

        recovery::process_interrupted_jobs(&ctx).await?;

        self.ctx = Some(ctx);
        self.start_poller()?;

        info!("Scheduler service has started");
        Ok(())
    }

    /// Resume polling after a pause. Errors when the scheduler is not
    /// started or the poller is already running.
    pub fn start_poller(&mut self) -> Result<()> {
        let ctx = self.ctx.as_ref().ok_or_else(|| {
            SchedulerError::InvalidOperation("scheduler has not been started".to_string())
        })?;

        if self.poller.is_some() {
            return Err(SchedulerError::InvalidOperation(
                "poller has already been started".to_string(),
            ));
        }

        self.poller = Some(Poller::spawn(Arc::clone(ctx)));
        Ok(())
    }

    /// Pause polling; blocks until the in-flight tick completes. Running
    /// jobs are unaffected.
    pub async fn stop_poller(&mut self) -> Result<()> {
        let poller = self.poller.take().ok_or_else(|| {
            SchedulerError::InvalidOperation("poller has not been started".to_string())
        })?;

        poller.stop().await;
        Ok(())
    }

    /// Graceful shutdown: persist all in-flight jobs, retire hosts within
    /// `timeout`, drain remaining completion events.
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.shutdown(timeout, ShutdownMode::Persist).await
    }

    /// Like [`stop`](Self::stop), but waits for natural completion instead
    /// of forcing persistence.
    pub async fn drain_stop(&mut self, timeout: Duration) -> Result<()> {
        self.shutdown(timeout, ShutdownMode::Drain).await
    }

    /// Cancel every in-flight job and force-retire hosts after `timeout`.
    pub async fn kill(&mut self, timeout: Duration) -> Result<()> {
        self.shutdown(timeout, ShutdownMode::Kill).await
    }

    async fn shutdown(&mut self, timeout: Duration, mode: ShutdownMode) -> Result<()> {
        let ctx = self.ctx.take().ok_or_else(|| {
            SchedulerError::InvalidOperation("scheduler has not been started".to_string())
        })?;

        // Intake stops with the poller; completion events keep queueing and
        // are drained below once hosts have wound down.
        if self.poller.is_some() {
            self.stop_poller().await?;
        }

        match mode {
            ShutdownMode::Persist => {
                for job in ctx.bookkeeping.running_jobs() {
                    if job.status == JobStatus::Executing {
                        ctx.persist_job(&job).await;
                    }
                }
            }
            ShutdownMode::Kill => {
                for job in ctx.bookkeeping.running_jobs() {
                    if job.status == JobStatus::Executing {
                        ctx.cancel_or_time_out_job(&job, false).await;
                    }
                }
            }
            ShutdownMode::Drain => {}
        }

        ctx.pool.retire_all(timeout).await;
        ctx.drain_finished_jobs().await;

        info!(
            mode = ?mode,
            remaining_jobs = ctx.bookkeeping.job_count(),
            "Scheduler service has stopped"
        );
        Ok(())
    }
}

fn process_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
