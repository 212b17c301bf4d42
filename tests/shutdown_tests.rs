//! Graceful stop, drain stop, kill, and persist/resume round trips.

use std::sync::Arc;
use std::time::Duration;

use scheduler_core::execution::JobWorkload;
use scheduler_core::orchestration::QueueManager;
use scheduler_core::test_helpers::{
    scheduled_record, single_queue_topology, test_config, wait_until, DelayedWorkload,
    InMemoryRegistry, UniformFactory, WaitingWorkload,
};
use scheduler_core::JobExecutionState;
use uuid::Uuid;

const CLUSTER: &str = "TestCluster";

fn setup(workload: Arc<dyn JobWorkload>) -> (Uuid, Arc<InMemoryRegistry>, QueueManager) {
    let queue_id = Uuid::new_v4();
    let topology = single_queue_topology(CLUSTER, queue_id, 4, Duration::from_secs(60));
    let registry = Arc::new(InMemoryRegistry::new(topology));
    let manager = QueueManager::new(
        test_config(CLUSTER),
        registry.clone(),
        Arc::new(UniformFactory::new(workload)),
    );
    (queue_id, registry, manager)
}

async fn start_executing_job(
    queue_id: Uuid,
    registry: &InMemoryRegistry,
    manager: &mut QueueManager,
) -> Uuid {
    let record = scheduled_record(queue_id, Uuid::new_v4(), "QueryWorkflow");
    let job_id = record.id;
    registry.insert_job(record);

    manager.start(true).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            registry.job(job_id).unwrap().state == JobExecutionState::Executing
        })
        .await,
        "job never reached executing"
    );
    job_id
}

#[tokio::test]
async fn test_stop_persists_in_flight_jobs() {
    let (queue_id, registry, mut manager) = setup(Arc::new(WaitingWorkload));
    let job_id = start_executing_job(queue_id, &registry, &mut manager).await;

    manager.stop(Duration::from_secs(2)).await.unwrap();

    let record = registry.job(job_id).unwrap();
    assert_eq!(record.state, JobExecutionState::Persisted);
    assert!(record.lock_owner.is_none());
    assert!(manager.context().is_none());
}

#[tokio::test]
async fn test_persisted_job_resumes_after_restart() {
    let (queue_id, registry, mut manager) = setup(Arc::new(WaitingWorkload));
    let job_id = start_executing_job(queue_id, &registry, &mut manager).await;

    manager.stop(Duration::from_secs(2)).await.unwrap();
    assert_eq!(
        registry.job(job_id).unwrap().state,
        JobExecutionState::Persisted
    );

    // Same process, fresh start: the persisted job is claimed again and
    // resumed from its checkpoint.
    manager.start(true).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            registry.job(job_id).unwrap().state == JobExecutionState::Executing
        })
        .await,
        "persisted job was not resumed"
    );

    manager.kill(Duration::from_millis(200)).await.unwrap();
}

#[tokio::test]
async fn test_pending_cancel_survives_persist_resume_round_trip() {
    let (queue_id, registry, mut manager) = setup(Arc::new(WaitingWorkload));
    let job_id = start_executing_job(queue_id, &registry, &mut manager).await;

    // Pause polling first so cancellation intake cannot act on the flag;
    // the stop then persists the job with the cancel still pending.
    manager.stop_poller().await.unwrap();
    registry.request_cancel(job_id);
    manager.stop(Duration::from_secs(2)).await.unwrap();

    let persisted = registry.job(job_id).unwrap();
    assert_eq!(persisted.state, JobExecutionState::Persisted);
    assert!(persisted.cancel_requested, "persist must keep the cancel flag");

    manager.start(true).await.unwrap();

    // After resume, cancellation intake picks the flag up and the job ends
    // cancelled.
    assert!(
        wait_until(Duration::from_secs(3), || {
            registry.job(job_id).unwrap().state == JobExecutionState::Cancelled
        })
        .await,
        "pending cancel was lost across the persist/resume round trip"
    );

    manager.kill(Duration::from_millis(200)).await.unwrap();
}

#[tokio::test]
async fn test_drain_stop_waits_for_natural_completion() {
    let (queue_id, registry, mut manager) =
        setup(Arc::new(DelayedWorkload::new(Duration::from_millis(100))));
    let job_id = start_executing_job(queue_id, &registry, &mut manager).await;

    manager.drain_stop(Duration::from_secs(2)).await.unwrap();

    let record = registry.job(job_id).unwrap();
    assert_eq!(record.state, JobExecutionState::Completed);
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn test_kill_cancels_in_flight_jobs() {
    let (queue_id, registry, mut manager) = setup(Arc::new(WaitingWorkload));
    let job_id = start_executing_job(queue_id, &registry, &mut manager).await;

    manager.kill(Duration::from_secs(2)).await.unwrap();

    let record = registry.job(job_id).unwrap();
    assert_eq!(record.state, JobExecutionState::Cancelled);
    assert!(record.lock_owner.is_none());
}

#[tokio::test]
async fn test_shutdown_without_start_is_rejected() {
    let (_, _, mut manager) = setup(Arc::new(WaitingWorkload));
    assert!(manager.stop(Duration::from_millis(100)).await.is_err());
    assert!(manager.kill(Duration::from_millis(100)).await.is_err());
}
