//! Completion events reported by execution hosts.
//!
//! Hosts push raw `{run_id, kind, error}` records through the sink; the
//! poller resolves run ids against bookkeeping when it drains, so a late or
//! duplicate event for an already-removed run id simply fails to resolve.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::JobExecutionState;

/// Terminal event kind reported by an execution host for one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Completed,
    Cancelled,
    TimedOut,
    Persisted,
    Failed,
}

impl CompletionKind {
    /// The registry state recorded when this event is drained.
    pub fn final_state(&self) -> JobExecutionState {
        match self {
            Self::Completed => JobExecutionState::Completed,
            Self::Cancelled => JobExecutionState::Cancelled,
            Self::TimedOut => JobExecutionState::TimedOut,
            Self::Persisted => JobExecutionState::Persisted,
            Self::Failed => JobExecutionState::Failed,
        }
    }

    /// Persisted jobs are checkpointed, not finished; they must not spawn
    /// the next instance of a recurring definition.
    pub fn reschedules_recurring(&self) -> bool {
        !matches!(self, Self::Persisted)
    }
}

/// One completion event, queued by a host callback and drained by the
/// poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletionEvent {
    pub run_id: Uuid,
    pub kind: CompletionKind,
    pub error_message: Option<String>,
}

/// Callback surface a host uses to report back into the scheduler.
///
/// Implementations must be cheap and non-blocking: callbacks run on host
/// task context, concurrently with the poller.
pub trait HostEventSink: Send + Sync + 'static {
    /// A job run reached a terminal event.
    fn job_completed(&self, run_id: Uuid, kind: CompletionKind, error_message: Option<String>);

    /// The host itself failed; every job it was running must be failed with
    /// the given message.
    fn host_faulted(&self, host_id: Uuid, error_message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_state_mapping() {
        assert_eq!(
            CompletionKind::Completed.final_state(),
            JobExecutionState::Completed
        );
        assert_eq!(
            CompletionKind::TimedOut.final_state(),
            JobExecutionState::TimedOut
        );
        assert_eq!(
            CompletionKind::Persisted.final_state(),
            JobExecutionState::Persisted
        );
    }

    #[test]
    fn test_persisted_does_not_reschedule() {
        assert!(!CompletionKind::Persisted.reschedules_recurring());
        assert!(CompletionKind::Failed.reschedules_recurring());
        assert!(CompletionKind::Completed.reschedules_recurring());
    }
}
