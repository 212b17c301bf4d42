//! Crash recovery.
//!
//! Runs once at startup, before the poller. Jobs found in an intermediate
//! state belong to no live scheduler instance: their locks are force
//! released so nothing stays stuck forever. A job that never got past
//! `Starting` has no side effects yet and is safe to rewind; anything
//! further along is failed and, if recurring, rescheduled.

use tracing::info;

use crate::error::Result;
use crate::models::{JobExecutionState, JobFilter};
use crate::orchestration::context::SchedulerContext;

/// Reason recorded on jobs interrupted by an unclean shutdown.
pub const UNEXPECTED_SHUTDOWN_REASON: &str = "Scheduler was shut down unexpectedly";

/// Reconcile jobs left behind by a previous instance of this scheduler.
///
/// Idempotent: a second pass over the same registry finds no interrupted
/// jobs and changes nothing.
pub(crate) async fn process_interrupted_jobs(ctx: &SchedulerContext) -> Result<()> {
    let filter = JobFilter::interrupted(ctx.topology.queue_ids());
    let records = ctx.registry.find_jobs(&filter).await?;

    let mut failed = 0usize;
    let mut rewound = 0usize;

    for record in records {
        ctx.registry.release_lock(record.id, true).await?;

        if record.state == JobExecutionState::Starting {
            ctx.registry
                .update_state(record.id, JobExecutionState::Scheduled, None)
                .await?;
            rewound += 1;
        } else {
            ctx.registry
                .record_finished(
                    record.id,
                    JobExecutionState::Failed,
                    Some(UNEXPECTED_SHUTDOWN_REASON),
                )
                .await?;
            ctx.registry.reschedule_if_recurring(record.id).await?;
            failed += 1;
        }
    }

    info!(failed, rewound, "Processed interrupted jobs");
    Ok(())
}
