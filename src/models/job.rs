//! Transient job representation owned by the scheduler.
//!
//! A `Job` exists only while this scheduler instance is responsible for the
//! corresponding registry record: created at intake, mutated by the poller
//! and host callbacks, dropped once the terminal registry update lands.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::states::JobRecord;

/// In-memory status of a job owned by this scheduler instance.
///
/// Distinct from the persisted [`JobExecutionState`](super::states::JobExecutionState):
/// this tracks where the job is in the local dispatch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Claimed from `Scheduled`, not yet dispatched
    Starting,
    /// Claimed from `Persisted`, will resume from checkpoint
    Resuming,
    /// Running inside an execution host
    Executing,
    /// Cancel signal sent to the host
    Cancelling,
    /// Timeout signal sent to the host
    TimingOut,
    /// Persist signal sent to the host
    Persisting,
}

/// How a workload is launched inside its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Fresh execution of a scheduled job
    Start,
    /// Resume from a persisted checkpoint
    Resume,
}

/// A job currently owned by this scheduler instance.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    /// Assigned by the execution host at dispatch; the bookkeeping key for
    /// completion events.
    pub run_id: Option<Uuid>,
    pub queue_id: Uuid,
    pub host_id: Option<Uuid>,
    pub user_id: Uuid,
    pub user_name: String,
    pub cluster_id: Uuid,
    pub domain_id: Uuid,
    pub federation_id: Uuid,
    pub name: String,
    pub external_id: i64,
    pub workflow_type: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub timeout: Option<Duration>,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

impl Job {
    /// Build the transient job from a freshly claimed registry record.
    pub fn from_record(record: &JobRecord, cluster_id: Uuid, status: JobStatus) -> Self {
        Self {
            id: record.id,
            run_id: None,
            queue_id: record.queue_id,
            host_id: None,
            user_id: record.user_id,
            user_name: record.user_name.clone(),
            cluster_id,
            domain_id: record.domain_id,
            federation_id: record.federation_id,
            name: record.name.clone(),
            external_id: record.external_id,
            workflow_type: record.workflow_type.clone(),
            scheduled_at: record.scheduled_at,
            started_at: None,
            timeout: record.timeout,
            status,
            cancel_requested: record.cancel_requested,
        }
    }

    /// Launch mode implied by how the job was claimed.
    pub fn launch_mode(&self) -> LaunchMode {
        match self.status {
            JobStatus::Resuming => LaunchMode::Resume,
            _ => LaunchMode::Start,
        }
    }

    /// Whether the job has been running longer than its effective timeout.
    /// The per-job override wins; the queue default applies otherwise.
    pub fn is_timed_out(&self, queue_default: Duration, now: DateTime<Utc>) -> bool {
        let Some(started_at) = self.started_at else {
            return false;
        };

        let effective = self.timeout.unwrap_or(queue_default);
        let Ok(effective) = chrono::Duration::from_std(effective) else {
            return false;
        };

        now - started_at > effective
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executing_job(timeout: Option<Duration>) -> Job {
        Job {
            id: Uuid::new_v4(),
            run_id: Some(Uuid::new_v4()),
            queue_id: Uuid::new_v4(),
            host_id: Some(Uuid::new_v4()),
            user_id: Uuid::new_v4(),
            user_name: "bob".to_string(),
            cluster_id: Uuid::new_v4(),
            domain_id: Uuid::new_v4(),
            federation_id: Uuid::new_v4(),
            name: "photometry".to_string(),
            external_id: 7,
            workflow_type: "ExportWorkflow".to_string(),
            scheduled_at: Some(Utc::now()),
            started_at: Some(Utc::now() - chrono::Duration::seconds(120)),
            timeout,
            status: JobStatus::Executing,
            cancel_requested: false,
        }
    }

    #[test]
    fn test_timeout_uses_queue_default() {
        let job = executing_job(None);
        assert!(job.is_timed_out(Duration::from_secs(60), Utc::now()));
        assert!(!job.is_timed_out(Duration::from_secs(600), Utc::now()));
    }

    #[test]
    fn test_job_override_beats_queue_default() {
        let job = executing_job(Some(Duration::from_secs(30)));
        // Queue default alone would not time this job out.
        assert!(job.is_timed_out(Duration::from_secs(600), Utc::now()));
    }

    #[test]
    fn test_unstarted_job_never_times_out() {
        let mut job = executing_job(None);
        job.started_at = None;
        assert!(!job.is_timed_out(Duration::from_secs(1), Utc::now()));
    }

    #[test]
    fn test_launch_mode_follows_status() {
        let mut job = executing_job(None);
        job.status = JobStatus::Starting;
        assert_eq!(job.launch_mode(), LaunchMode::Start);
        job.status = JobStatus::Resuming;
        assert_eq!(job.launch_mode(), LaunchMode::Resume);
    }
}
