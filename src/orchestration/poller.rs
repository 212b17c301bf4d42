//! The poller loop.
//!
//! A single background task executes five steps in strict order every tick:
//! timeout scan, intake, cancellation intake, finished-job draining, idle
//! host reclamation. The steps never overlap; host callbacks and control
//! operations only meet the loop at the bookkeeping lock.
//!
//! A registry failure during intake or cancellation intake is confined to
//! the affected queue and tick: the queue reads as empty and the loop goes
//! on. Nothing thrown here may kill the poller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::topology::QueueDefinition;
use crate::models::{Job, JobExecutionState, JobFilter, JobStatus};
use crate::orchestration::context::SchedulerContext;

/// Handle to a running poller. One-shot: stopping consumes it, a later
/// resume spawns a fresh one.
pub(crate) struct Poller {
    stop_requested: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Poller {
    pub(crate) fn spawn(ctx: Arc<SchedulerContext>) -> Self {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let handle = tokio::spawn(run_loop(
            ctx,
            Arc::clone(&stop_requested),
            Arc::clone(&wake),
        ));

        info!("Job poller started");

        Self {
            stop_requested,
            wake,
            handle,
        }
    }

    /// Request a stop and wait for the in-flight tick to complete. No tick
    /// is ever left half-applied.
    pub(crate) async fn stop(self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wake.notify_one();
        let _ = self.handle.await;
        info!("Job poller stopped");
    }
}

async fn run_loop(ctx: Arc<SchedulerContext>, stop_requested: Arc<AtomicBool>, wake: Arc<Notify>) {
    loop {
        if stop_requested.load(Ordering::Acquire) {
            break;
        }

        tick(&ctx).await;

        tokio::select! {
            _ = tokio::time::sleep(ctx.config.polling_interval) => {}
            _ = wake.notified() => {}
        }
    }
}

async fn tick(ctx: &SchedulerContext) {
    process_timed_out_jobs(ctx).await;
    poll_and_start_jobs(ctx).await;
    poll_and_cancel_jobs(ctx).await;
    ctx.drain_finished_jobs().await;
    reclaim_idle_hosts(ctx).await;
}

/// Step 1: cancel-with-timeout every executing job that has outlived its
/// effective timeout.
async fn process_timed_out_jobs(ctx: &SchedulerContext) {
    let now = Utc::now();

    let timed_out: Vec<Job> = ctx
        .bookkeeping
        .running_jobs()
        .into_iter()
        .filter(|job| job.status == JobStatus::Executing)
        .filter(|job| {
            let queue_default = ctx
                .topology
                .queues
                .get(&job.queue_id)
                .map(|q| q.timeout)
                .unwrap_or(ctx.config.default_queue_timeout);
            job.is_timed_out(queue_default, now)
        })
        .collect();

    for job in timed_out {
        ctx.cancel_or_time_out_job(&job, true).await;
    }
}

/// Step 2: per-queue intake up to the admission bound.
async fn poll_and_start_jobs(ctx: &SchedulerContext) {
    for queue in ctx.topology.queues.values() {
        match poll_new_jobs(ctx, queue).await {
            Ok(jobs) => {
                for job in jobs {
                    start_or_resume_job(ctx, job).await;
                }
            }
            Err(err) => {
                error!(
                    queue_id = %queue.id,
                    queue = %queue.name,
                    error = %err,
                    "Intake failed; treating queue as empty this tick"
                );
            }
        }
    }
}

async fn poll_new_jobs(ctx: &SchedulerContext, queue: &QueueDefinition) -> Result<Vec<Job>> {
    let in_flight = ctx.bookkeeping.queue_in_flight(queue.id);
    let admission = queue.max_outstanding_jobs.saturating_sub(in_flight);
    if admission == 0 {
        return Ok(Vec::new());
    }

    let last_user = ctx.bookkeeping.last_served_user(queue.id);
    let records = ctx
        .registry
        .find_next_jobs(queue.id, last_user, admission)
        .await?;

    let mut jobs = Vec::with_capacity(records.len());

    for record in records {
        if !record.state.is_eligible_for_intake() {
            warn!(job_id = %record.id, state = %record.state, "Skipping ineligible job from intake");
            continue;
        }

        let resuming = record.state == JobExecutionState::Persisted;

        // The conditional registry write is the serialization point between
        // scheduler instances; losing the race just means skipping the job.
        if !ctx.registry.mark_starting(record.id).await? {
            continue;
        }

        let status = if resuming {
            JobStatus::Resuming
        } else {
            JobStatus::Starting
        };
        jobs.push(Job::from_record(&record, ctx.topology.cluster_id, status));
    }

    Ok(jobs)
}

/// Lock, stamp and dispatch one claimed job. On registry failure the record
/// stays `Starting` and crash recovery rewinds it later; on dispatch
/// failure the job is failed immediately so it is never stranded.
async fn start_or_resume_job(ctx: &SchedulerContext, mut job: Job) {
    if let Err(err) = ctx.registry.obtain_lock(job.id, ctx.instance_id).await {
        error!(job_id = %job.id, error = %err, "Failed to lock claimed job");
        return;
    }

    if let Err(err) = ctx.registry.mark_started(job.id, Utc::now()).await {
        error!(job_id = %job.id, error = %err, "Failed to stamp job start time");
        return;
    }

    match job.status {
        JobStatus::Resuming => {
            info!(job_id = %job.id, external_id = job.external_id, "Resuming job")
        }
        _ => info!(job_id = %job.id, external_id = job.external_id, "Starting job"),
    }

    if let Err(err) = ctx.pool.dispatch(&mut job) {
        let message = err.innermost_message();
        error!(job_id = %job.id, error = %err, "Dispatch failed; failing job");

        if let Err(err) = ctx
            .registry
            .record_finished(job.id, JobExecutionState::Failed, Some(&message))
            .await
        {
            error!(job_id = %job.id, error = %err, "Failed to record dispatch failure");
        }
        let _ = ctx.registry.release_lock(job.id, false).await;
        let _ = ctx.registry.reschedule_if_recurring(job.id).await;
        return;
    }

    let job_id = job.id;
    if let Err(err) = ctx.bookkeeping.add_job(job) {
        error!(error = %err, "Dispatched job could not be bookkept");
        return;
    }

    if let Err(err) = ctx
        .registry
        .update_state(job_id, JobExecutionState::Executing, None)
        .await
    {
        error!(job_id = %job_id, error = %err, "Failed to mark job executing");
    }
}

/// Step 3: pick up cancel requests for jobs this instance owns. Requests
/// for jobs running elsewhere (or already gone) are ignored.
async fn poll_and_cancel_jobs(ctx: &SchedulerContext) {
    for queue in ctx.topology.queues.values() {
        match poll_cancelling_jobs(ctx, queue).await {
            Ok(jobs) => {
                for job in jobs {
                    ctx.cancel_or_time_out_job(&job, false).await;
                }
            }
            Err(err) => {
                error!(
                    queue_id = %queue.id,
                    queue = %queue.name,
                    error = %err,
                    "Cancellation intake failed; treating queue as empty this tick"
                );
            }
        }
    }
}

async fn poll_cancelling_jobs(
    ctx: &SchedulerContext,
    queue: &QueueDefinition,
) -> Result<Vec<Job>> {
    let records = ctx
        .registry
        .find_jobs(&JobFilter::cancel_requested(queue.id))
        .await?;

    Ok(records
        .into_iter()
        .filter_map(|record| ctx.bookkeeping.get_job(record.id))
        .filter(|job| job.status == JobStatus::Executing)
        .collect())
}

/// Step 5: retire hosts with no running jobs past the idle threshold, plus
/// any host that has faulted.
async fn reclaim_idle_hosts(ctx: &SchedulerContext) {
    ctx.pool
        .retire_idle(ctx.config.host_idle_timeout, ctx.config.host_stop_timeout)
        .await;
}
