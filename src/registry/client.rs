//! Registry client contract.
//!
//! The registry is the single source of truth for job ownership across
//! scheduler instances. Every operation here is one scoped round trip that
//! opens, applies and commits on its own; callers treat failures as
//! transient unless they happen during startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ClusterTopology, JobExecutionState, JobFilter, JobRecord};

#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Load the topology snapshot for the named cluster. `with_layout`
    /// includes the database definitions and instances; lightweight callers
    /// (tests) skip that walk.
    async fn load_cluster(&self, cluster_name: &str, with_layout: bool)
        -> Result<ClusterTopology>;

    /// Fetch up to `max_count` next-eligible job records for one queue,
    /// ordered round-robin fair: jobs owned by users other than
    /// `last_user_id` come first, so no single user can monopolize a queue
    /// across ticks.
    async fn find_next_jobs(
        &self,
        queue_id: Uuid,
        last_user_id: Option<Uuid>,
        max_count: usize,
    ) -> Result<Vec<JobRecord>>;

    /// Fetch job records matching the filter.
    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>>;

    /// Conditionally transition a job from `Scheduled`/`Persisted` to
    /// `Starting`. This atomic update is the serialization point between
    /// scheduler instances polling the same queue: exactly one caller
    /// observes `true`, everyone else lost the race and must skip the job.
    async fn mark_starting(&self, job_id: Uuid) -> Result<bool>;

    /// Record the dispatch start time.
    async fn mark_started(&self, job_id: Uuid, started_at: DateTime<Utc>) -> Result<()>;

    /// Set a non-terminal state (e.g. `Executing`, `Cancelling`,
    /// `Persisting`), optionally with an error message.
    async fn update_state(
        &self,
        job_id: Uuid,
        state: JobExecutionState,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Set a finishing state together with the finish timestamp. Used for
    /// both terminal events and `Persisted`.
    async fn record_finished(
        &self,
        job_id: Uuid,
        state: JobExecutionState,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Take the optimistic lock for this scheduler instance. Fails when
    /// another instance already holds it.
    async fn obtain_lock(&self, job_id: Uuid, owner: Uuid) -> Result<()>;

    /// Release the optimistic lock. With `force`, release regardless of the
    /// current owner; used by crash recovery on locks whose owner no longer
    /// exists.
    async fn release_lock(&self, job_id: Uuid, force: bool) -> Result<()>;

    /// If the finished job's definition is recurring, create the next
    /// scheduled instance. No-op otherwise.
    async fn reschedule_if_recurring(&self, job_id: Uuid) -> Result<()>;
}
