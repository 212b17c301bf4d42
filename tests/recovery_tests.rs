//! Crash-recovery reconciliation: interrupted jobs found at startup.

use std::sync::Arc;
use std::time::Duration;

use scheduler_core::orchestration::{QueueManager, UNEXPECTED_SHUTDOWN_REASON};
use scheduler_core::test_helpers::{
    scheduled_record, single_queue_topology, test_config, CompletingWorkload, InMemoryRegistry,
    UniformFactory,
};
use scheduler_core::{JobExecutionState, JobRecord};
use uuid::Uuid;

const CLUSTER: &str = "TestCluster";

/// Queue with zero admission: recovery runs, intake never claims anything,
/// so post-recovery states stay observable.
fn setup() -> (Uuid, Arc<InMemoryRegistry>, QueueManager) {
    let queue_id = Uuid::new_v4();
    let topology = single_queue_topology(CLUSTER, queue_id, 0, Duration::from_secs(60));
    let registry = Arc::new(InMemoryRegistry::new(topology));
    let manager = QueueManager::new(
        test_config(CLUSTER),
        registry.clone(),
        Arc::new(UniformFactory::new(Arc::new(CompletingWorkload))),
    );
    (queue_id, registry, manager)
}

fn interrupted_record(queue_id: Uuid, state: JobExecutionState) -> JobRecord {
    let mut record = scheduled_record(queue_id, Uuid::new_v4(), "QueryWorkflow");
    record.state = state;
    record.lock_owner = Some(Uuid::new_v4());
    record.started_at = Some(chrono::Utc::now());
    record
}

#[tokio::test]
async fn test_starting_jobs_are_rewound_to_scheduled() {
    let (queue_id, registry, mut manager) = setup();

    let starting = interrupted_record(queue_id, JobExecutionState::Starting);
    let starting_id = starting.id;
    registry.insert_job(starting);

    manager.start(true).await.unwrap();

    let record = registry.job(starting_id).unwrap();
    assert_eq!(record.state, JobExecutionState::Scheduled);
    assert!(record.lock_owner.is_none(), "lock must be force released");
    assert!(record.error_message.is_none());

    manager.kill(Duration::from_millis(100)).await.unwrap();
}

#[tokio::test]
async fn test_interrupted_jobs_are_failed_with_shutdown_reason() {
    let (queue_id, registry, mut manager) = setup();

    let mut ids = Vec::new();
    for state in [
        JobExecutionState::Executing,
        JobExecutionState::Persisting,
        JobExecutionState::Cancelling,
    ] {
        let record = interrupted_record(queue_id, state);
        ids.push(record.id);
        registry.insert_job(record);
    }

    manager.start(true).await.unwrap();

    for id in ids {
        let record = registry.job(id).unwrap();
        assert_eq!(record.state, JobExecutionState::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some(UNEXPECTED_SHUTDOWN_REASON)
        );
        assert!(record.lock_owner.is_none());
        assert!(record.finished_at.is_some());
    }

    manager.kill(Duration::from_millis(100)).await.unwrap();
}

#[tokio::test]
async fn test_terminal_and_scheduled_jobs_are_left_alone() {
    let (queue_id, registry, mut manager) = setup();

    let scheduled = scheduled_record(queue_id, Uuid::new_v4(), "QueryWorkflow");
    let scheduled_id = scheduled.id;
    registry.insert_job(scheduled);

    let mut completed = scheduled_record(queue_id, Uuid::new_v4(), "QueryWorkflow");
    completed.state = JobExecutionState::Completed;
    let completed_id = completed.id;
    registry.insert_job(completed);

    manager.start(true).await.unwrap();

    assert_eq!(
        registry.job(scheduled_id).unwrap().state,
        JobExecutionState::Scheduled
    );
    assert_eq!(
        registry.job(completed_id).unwrap().state,
        JobExecutionState::Completed
    );

    manager.kill(Duration::from_millis(100)).await.unwrap();
}

#[tokio::test]
async fn test_recurring_interrupted_job_is_rescheduled_once() {
    let (queue_id, registry, mut manager) = setup();

    let mut record = interrupted_record(queue_id, JobExecutionState::Executing);
    record.recurring = true;
    let job_id = record.id;
    registry.insert_job(record);

    manager.start(true).await.unwrap();

    assert_eq!(
        registry.job(job_id).unwrap().state,
        JobExecutionState::Failed
    );
    assert_eq!(registry.job_count(), 2, "exactly one new instance");
    assert_eq!(
        registry.jobs_in_state(JobExecutionState::Scheduled).len(),
        1
    );

    manager.kill(Duration::from_millis(100)).await.unwrap();
}

#[tokio::test]
async fn test_recovery_is_idempotent_across_restarts() {
    let (queue_id, registry, mut manager) = setup();

    let starting = interrupted_record(queue_id, JobExecutionState::Starting);
    let starting_id = starting.id;
    registry.insert_job(starting);

    let mut executing = interrupted_record(queue_id, JobExecutionState::Executing);
    executing.recurring = true;
    let executing_id = executing.id;
    registry.insert_job(executing);

    manager.start(true).await.unwrap();
    manager.kill(Duration::from_millis(100)).await.unwrap();

    let after_first: Vec<_> = [starting_id, executing_id]
        .iter()
        .map(|id| registry.job(*id).unwrap().state)
        .collect();
    let count_after_first = registry.job_count();

    // Second pass over the same registry: nothing further changes, no
    // double rescheduling.
    manager.start(true).await.unwrap();
    manager.kill(Duration::from_millis(100)).await.unwrap();

    let after_second: Vec<_> = [starting_id, executing_id]
        .iter()
        .map(|id| registry.job(*id).unwrap().state)
        .collect();

    assert_eq!(after_first, after_second);
    assert_eq!(registry.job_count(), count_after_first);
}
