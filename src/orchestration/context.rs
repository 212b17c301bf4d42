//! Process-wide scheduler context.
//!
//! Built once by the queue manager at start and injected into the poller
//! and recovery; nothing reaches for ambient globals. The job-control
//! operations shared by the poller and the shutdown paths live here.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::execution::events::JobCompletionEvent;
use crate::execution::pool::ExecutionHostPool;
use crate::models::{ClusterTopology, Job, JobExecutionState, JobStatus};
use crate::orchestration::bookkeeping::Bookkeeping;
use crate::registry::client::JobRegistry;

/// Everything one running scheduler instance owns.
pub struct SchedulerContext {
    pub config: SchedulerConfig,
    /// Identity of this scheduler instance; owner of registry locks.
    pub instance_id: Uuid,
    /// Command-line mode rather than service mode; affects log formatting.
    pub interactive: bool,
    pub registry: Arc<dyn JobRegistry>,
    pub topology: ClusterTopology,
    pub bookkeeping: Arc<Bookkeeping>,
    pub pool: ExecutionHostPool,
}

impl SchedulerContext {
    /// Cancel path, shared by cancellation intake, the timeout scan and
    /// kill. Marks the registry record `Cancelling`, then signals the host;
    /// the terminal transition arrives later as a completion event.
    pub(crate) async fn cancel_or_time_out_job(&self, job: &Job, timed_out: bool) {
        if let Err(err) = self
            .registry
            .update_state(job.id, JobExecutionState::Cancelling, None)
            .await
        {
            error!(job_id = %job.id, error = %err, "Failed to mark job cancelling");
            return;
        }

        let (status, signal) = if timed_out {
            info!(job_id = %job.id, external_id = job.external_id, "Job is timing out");
            (JobStatus::TimingOut, self.pool.time_out(job))
        } else {
            info!(job_id = %job.id, external_id = job.external_id, "Job is cancelling");
            (JobStatus::Cancelling, self.pool.cancel(job))
        };

        self.bookkeeping.set_status(job.id, status);

        if let Err(err) = signal {
            // The host may have finished the job between our snapshot and
            // the signal; the completion event wins.
            warn!(job_id = %job.id, error = %err, "Cancel signal not delivered");
        }
    }

    /// Graceful-stop path: ask the host to checkpoint the job. The
    /// `Persisted` completion event removes it from bookkeeping.
    pub(crate) async fn persist_job(&self, job: &Job) {
        if let Err(err) = self
            .registry
            .update_state(job.id, JobExecutionState::Persisting, None)
            .await
        {
            error!(job_id = %job.id, error = %err, "Failed to mark job persisting");
            return;
        }

        info!(job_id = %job.id, external_id = job.external_id, "Persisting job");
        self.bookkeeping.set_status(job.id, JobStatus::Persisting);

        if let Err(err) = self.pool.persist(job) {
            warn!(job_id = %job.id, error = %err, "Persist signal not delivered");
        }
    }

    /// Drain every queued completion event: apply the registry transition
    /// and drop the job from bookkeeping. Events whose run id no longer
    /// resolves are duplicates or latecomers and are dropped silently.
    pub(crate) async fn drain_finished_jobs(&self) {
        for event in self.bookkeeping.drain_events() {
            match self.bookkeeping.remove_by_run_id(event.run_id) {
                Some(job) => self.finish_job(&job, &event).await,
                None => {
                    debug!(run_id = %event.run_id, "Dropping completion event for unknown run id");
                }
            }
        }
    }

    async fn finish_job(&self, job: &Job, event: &JobCompletionEvent) {
        let state = event.kind.final_state();
        info!(
            job_id = %job.id,
            external_id = job.external_id,
            state = %state,
            "Job finished"
        );

        if let Err(err) = self
            .registry
            .record_finished(job.id, state, event.error_message.as_deref())
            .await
        {
            error!(job_id = %job.id, error = %err, "Failed to record finished job");
            return;
        }

        if let Err(err) = self.registry.release_lock(job.id, false).await {
            error!(job_id = %job.id, error = %err, "Failed to release job lock");
        }

        if event.kind.reschedules_recurring() {
            if let Err(err) = self.registry.reschedule_if_recurring(job.id).await {
                error!(job_id = %job.id, error = %err, "Failed to reschedule recurring job");
            }
        }
    }
}
