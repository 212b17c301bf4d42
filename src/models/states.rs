//! Persisted job execution states and registry record mirrors.
//!
//! The registry stores exactly one `JobExecutionState` per job instance plus
//! a separate `cancel_requested` flag. Cancellation is an overlay on an
//! executing job, not a state of its own, so keeping it out of the enum
//! avoids ambiguous combinations.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job execution state as persisted in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExecutionState {
    /// Eligible for intake on its queue
    Scheduled,
    /// Claimed by a scheduler instance, not yet running
    Starting,
    /// Running inside an execution host
    Executing,
    /// Cancel or timeout signalled, waiting for the host to confirm
    Cancelling,
    /// Terminal: finished successfully
    Completed,
    /// Terminal: cancelled on request
    Cancelled,
    /// Terminal: exceeded its timeout
    TimedOut,
    /// Terminal: failed with an error message
    Failed,
    /// Checkpoint requested, waiting for the host to confirm
    Persisting,
    /// Checkpointed; eligible for resume on a later intake
    Persisted,
}

impl JobExecutionState {
    /// Terminal states allow no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::TimedOut | Self::Failed
        )
    }

    /// States a crashed scheduler instance can leave behind. Jobs found in
    /// one of these at startup belong to no live instance and must be
    /// reconciled before polling begins.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            Self::Executing | Self::Persisting | Self::Cancelling | Self::Starting
        )
    }

    /// States from which intake may claim a job.
    pub fn is_eligible_for_intake(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Persisted)
    }
}

impl fmt::Display for JobExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Starting => write!(f, "starting"),
            Self::Executing => write!(f, "executing"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Failed => write!(f, "failed"),
            Self::Persisting => write!(f, "persisting"),
            Self::Persisted => write!(f, "persisted"),
        }
    }
}

impl std::str::FromStr for JobExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "starting" => Ok(Self::Starting),
            "executing" => Ok(Self::Executing),
            "cancelling" => Ok(Self::Cancelling),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            "failed" => Ok(Self::Failed),
            "persisting" => Ok(Self::Persisting),
            "persisted" => Ok(Self::Persisted),
            _ => Err(format!("Invalid job execution state: {s}")),
        }
    }
}

/// Mirror of a registry job instance row, as consumed by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub name: String,
    /// Human-facing numeric id used in audit messages.
    pub external_id: i64,
    pub workflow_type: String,
    pub state: JobExecutionState,
    pub cancel_requested: bool,
    pub recurring: bool,
    /// Per-job timeout override; the queue default applies when absent.
    pub timeout: Option<Duration>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Scheduler instance currently holding the optimistic lock.
    pub lock_owner: Option<Uuid>,
    pub domain_id: Uuid,
    pub federation_id: Uuid,
}

/// Filter for `JobRegistry::find_jobs`. Empty collections mean "any".
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue_ids: Vec<Uuid>,
    pub user_id: Option<Uuid>,
    pub states: Vec<JobExecutionState>,
    pub cancel_requested: Option<bool>,
}

impl JobFilter {
    /// Jobs a crashed instance may have left behind in the given queues.
    pub fn interrupted(queue_ids: Vec<Uuid>) -> Self {
        Self {
            queue_ids,
            states: vec![
                JobExecutionState::Executing,
                JobExecutionState::Persisting,
                JobExecutionState::Cancelling,
                JobExecutionState::Starting,
            ],
            ..Self::default()
        }
    }

    /// Jobs flagged for cancellation on one queue, any state.
    pub fn cancel_requested(queue_id: Uuid) -> Self {
        Self {
            queue_ids: vec![queue_id],
            cancel_requested: Some(true),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if !self.queue_ids.is_empty() && !self.queue_ids.contains(&record.queue_id) {
            return false;
        }
        if let Some(user_id) = self.user_id {
            if record.user_id != user_id {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&record.state) {
            return false;
        }
        if let Some(flag) = self.cancel_requested {
            if record.cancel_requested != flag {
                return false;
            }
        }
        true
    }
}
