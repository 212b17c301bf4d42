//! Test support: an in-memory registry, scripted workloads and small
//! builders used by the integration tests (and useful to downstream crates
//! testing against the scheduler).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::execution::events::CompletionKind;
use crate::execution::host::{ControlSignal, JobWorkload, SignalReceiver, WorkloadFactory};
use crate::models::topology::{ClusterTopology, QueueDefinition};
use crate::models::{Job, JobExecutionState, JobFilter, JobRecord, LaunchMode};
use crate::registry::client::JobRegistry;

/// Registry double backed by plain maps. Single-process semantics match
/// the contract the scheduler relies on: `mark_starting` is conditional,
/// locks are exclusive, recurring jobs respawn on completion.
pub struct InMemoryRegistry {
    topology: ClusterTopology,
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
    /// When set, find operations fail, simulating a registry outage.
    fail_finds: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new(topology: ClusterTopology) -> Self {
        Self {
            topology,
            jobs: Mutex::new(HashMap::new()),
            fail_finds: AtomicBool::new(false),
        }
    }

    pub fn insert_job(&self, record: JobRecord) {
        self.jobs.lock().insert(record.id, record);
    }

    pub fn job(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs.lock().get(&job_id).cloned()
    }

    pub fn jobs_in_state(&self, state: JobExecutionState) -> Vec<JobRecord> {
        self.jobs
            .lock()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn request_cancel(&self, job_id: Uuid) {
        if let Some(record) = self.jobs.lock().get_mut(&job_id) {
            record.cancel_requested = true;
        }
    }

    pub fn set_fail_finds(&self, fail: bool) {
        self.fail_finds.store(fail, Ordering::Release);
    }

    fn check_find_outage(&self) -> Result<()> {
        if self.fail_finds.load(Ordering::Acquire) {
            return Err(SchedulerError::Registry(
                "simulated registry outage".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRegistry for InMemoryRegistry {
    async fn load_cluster(
        &self,
        cluster_name: &str,
        with_layout: bool,
    ) -> Result<ClusterTopology> {
        if cluster_name != self.topology.cluster_name {
            return Err(SchedulerError::Topology(format!(
                "unknown cluster {cluster_name}"
            )));
        }

        let mut topology = self.topology.clone();
        if !with_layout {
            topology.database_definitions.clear();
            topology.database_instances.clear();
        }
        Ok(topology)
    }

    async fn find_next_jobs(
        &self,
        queue_id: Uuid,
        last_user_id: Option<Uuid>,
        max_count: usize,
    ) -> Result<Vec<JobRecord>> {
        self.check_find_outage()?;

        let jobs = self.jobs.lock();
        let mut eligible: Vec<JobRecord> = jobs
            .values()
            .filter(|r| r.queue_id == queue_id)
            .filter(|r| r.state.is_eligible_for_intake())
            .filter(|r| r.lock_owner.is_none())
            .cloned()
            .collect();

        // Round-robin fairness: users other than the last-served one first,
        // oldest scheduled within each group.
        eligible.sort_by_key(|r| {
            (
                last_user_id.is_some() && Some(r.user_id) == last_user_id,
                r.scheduled_at,
            )
        });
        eligible.truncate(max_count);
        Ok(eligible)
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.check_find_outage()?;

        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn mark_starting(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&job_id) {
            Some(record) if record.state.is_eligible_for_intake() => {
                record.state = JobExecutionState::Starting;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_started(&self, job_id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        if let Some(record) = self.jobs.lock().get_mut(&job_id) {
            record.started_at = Some(started_at);
        }
        Ok(())
    }

    async fn update_state(
        &self,
        job_id: Uuid,
        state: JobExecutionState,
        error_message: Option<&str>,
    ) -> Result<()> {
        if let Some(record) = self.jobs.lock().get_mut(&job_id) {
            record.state = state;
            record.error_message = error_message.map(String::from);
        }
        Ok(())
    }

    async fn record_finished(
        &self,
        job_id: Uuid,
        state: JobExecutionState,
        error_message: Option<&str>,
    ) -> Result<()> {
        if let Some(record) = self.jobs.lock().get_mut(&job_id) {
            record.state = state;
            record.error_message = error_message.map(String::from);
            record.finished_at = Some(Utc::now());
            if state.is_terminal() {
                record.cancel_requested = false;
            }
        }
        Ok(())
    }

    async fn obtain_lock(&self, job_id: Uuid, owner: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let record = jobs.get_mut(&job_id).ok_or_else(|| {
            SchedulerError::Registry(format!("unknown job {job_id}"))
        })?;

        match record.lock_owner {
            Some(existing) if existing != owner => Err(SchedulerError::Registry(format!(
                "job {job_id} is locked by {existing}"
            ))),
            _ => {
                record.lock_owner = Some(owner);
                Ok(())
            }
        }
    }

    async fn release_lock(&self, job_id: Uuid, _force: bool) -> Result<()> {
        if let Some(record) = self.jobs.lock().get_mut(&job_id) {
            record.lock_owner = None;
        }
        Ok(())
    }

    async fn reschedule_if_recurring(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let Some(record) = jobs.get(&job_id) else {
            return Ok(());
        };

        if record.recurring {
            let mut next = record.clone();
            next.id = Uuid::new_v4();
            next.state = JobExecutionState::Scheduled;
            next.cancel_requested = false;
            next.scheduled_at = Some(Utc::now());
            next.started_at = None;
            next.finished_at = None;
            next.error_message = None;
            next.lock_owner = None;
            jobs.insert(next.id, next);
        }
        Ok(())
    }
}

/// Completes immediately.
pub struct CompletingWorkload;

#[async_trait]
impl JobWorkload for CompletingWorkload {
    async fn execute(
        &self,
        _job: Job,
        _mode: LaunchMode,
        _signals: SignalReceiver,
    ) -> Result<CompletionKind> {
        Ok(CompletionKind::Completed)
    }
}

/// Runs until a control signal arrives and reports the matching terminal
/// event. Teardown (channel close) reads as cancellation.
pub struct WaitingWorkload;

#[async_trait]
impl JobWorkload for WaitingWorkload {
    async fn execute(
        &self,
        _job: Job,
        _mode: LaunchMode,
        mut signals: SignalReceiver,
    ) -> Result<CompletionKind> {
        Ok(match signals.recv().await {
            Some(ControlSignal::Cancel) | None => CompletionKind::Cancelled,
            Some(ControlSignal::TimeOut) => CompletionKind::TimedOut,
            Some(ControlSignal::Persist) => CompletionKind::Persisted,
        })
    }
}

/// Completes after a fixed delay, unless a control signal arrives first.
pub struct DelayedWorkload {
    delay: Duration,
}

impl DelayedWorkload {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl JobWorkload for DelayedWorkload {
    async fn execute(
        &self,
        _job: Job,
        _mode: LaunchMode,
        mut signals: SignalReceiver,
    ) -> Result<CompletionKind> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(CompletionKind::Completed),
            signal = signals.recv() => Ok(match signal {
                Some(ControlSignal::Cancel) | None => CompletionKind::Cancelled,
                Some(ControlSignal::TimeOut) => CompletionKind::TimedOut,
                Some(ControlSignal::Persist) => CompletionKind::Persisted,
            }),
        }
    }
}

#[derive(Debug)]
struct WorkloadFailure(String);

impl std::fmt::Display for WorkloadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for WorkloadFailure {}

/// Fails every job with the given message.
pub struct FailingWorkload {
    message: String,
}

impl FailingWorkload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl JobWorkload for FailingWorkload {
    async fn execute(
        &self,
        _job: Job,
        _mode: LaunchMode,
        _signals: SignalReceiver,
    ) -> Result<CompletionKind> {
        Err(SchedulerError::Workload(Box::new(WorkloadFailure(
            self.message.clone(),
        ))))
    }
}

/// Panics, simulating an unhandled fault inside the host sandbox.
pub struct PanickingWorkload {
    message: String,
}

impl PanickingWorkload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl JobWorkload for PanickingWorkload {
    async fn execute(
        &self,
        _job: Job,
        _mode: LaunchMode,
        _signals: SignalReceiver,
    ) -> Result<CompletionKind> {
        panic!("{}", self.message.clone());
    }
}

/// Hands the same workload to every workload type.
pub struct UniformFactory {
    workload: Arc<dyn JobWorkload>,
}

impl UniformFactory {
    pub fn new(workload: Arc<dyn JobWorkload>) -> Self {
        Self { workload }
    }
}

impl WorkloadFactory for UniformFactory {
    fn create(&self, _workflow_type: &str) -> Result<Arc<dyn JobWorkload>> {
        Ok(Arc::clone(&self.workload))
    }
}

/// Maps workload types to workloads; unknown types fail to create, which
/// exercises the dispatch-failure path.
pub struct TypeMapFactory {
    workloads: HashMap<String, Arc<dyn JobWorkload>>,
}

impl TypeMapFactory {
    pub fn new(workloads: HashMap<String, Arc<dyn JobWorkload>>) -> Self {
        Self { workloads }
    }
}

impl WorkloadFactory for TypeMapFactory {
    fn create(&self, workflow_type: &str) -> Result<Arc<dyn JobWorkload>> {
        self.workloads
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| SchedulerError::Host(format!("no workload for type {workflow_type}")))
    }
}

/// A one-queue topology for scheduler tests.
pub fn single_queue_topology(
    cluster_name: &str,
    queue_id: Uuid,
    max_outstanding_jobs: usize,
    timeout: Duration,
) -> ClusterTopology {
    let mut topology = ClusterTopology {
        cluster_id: Uuid::new_v4(),
        cluster_name: cluster_name.to_string(),
        ..ClusterTopology::default()
    };
    topology.queues.insert(
        queue_id,
        QueueDefinition {
            id: queue_id,
            name: "default".to_string(),
            machine_id: None,
            max_outstanding_jobs,
            timeout,
        },
    );
    topology
}

/// A scheduled job record ready for intake.
pub fn scheduled_record(queue_id: Uuid, user_id: Uuid, workflow_type: &str) -> JobRecord {
    JobRecord {
        id: Uuid::new_v4(),
        queue_id,
        user_id,
        user_name: "tester".to_string(),
        name: "test-job".to_string(),
        external_id: 1,
        workflow_type: workflow_type.to_string(),
        state: JobExecutionState::Scheduled,
        cancel_requested: false,
        recurring: false,
        timeout: None,
        scheduled_at: Some(Utc::now()),
        started_at: None,
        finished_at: None,
        error_message: None,
        lock_owner: None,
        domain_id: Uuid::new_v4(),
        federation_id: Uuid::new_v4(),
    }
}

/// Fast-tick configuration for integration tests.
pub fn test_config(cluster_name: &str) -> SchedulerConfig {
    SchedulerConfig {
        cluster_name: cluster_name.to_string(),
        polling_interval: Duration::from_millis(20),
        default_queue_timeout: Duration::from_secs(60),
        host_idle_timeout: Duration::from_millis(200),
        host_stop_timeout: Duration::from_millis(500),
        layout_required: false,
        ..SchedulerConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_queue() -> (Uuid, InMemoryRegistry) {
        let queue_id = Uuid::new_v4();
        let topology =
            single_queue_topology("TestCluster", queue_id, 4, Duration::from_secs(60));
        (queue_id, InMemoryRegistry::new(topology))
    }

    #[test]
    fn test_mark_starting_is_conditional() {
        tokio_test::block_on(async {
            let (queue_id, registry) = registry_with_queue();
            let record = scheduled_record(queue_id, Uuid::new_v4(), "QueryWorkflow");
            let job_id = record.id;
            registry.insert_job(record);

            // First claim wins, second loses.
            assert!(registry.mark_starting(job_id).await.unwrap());
            assert!(!registry.mark_starting(job_id).await.unwrap());
            assert_eq!(
                registry.job(job_id).unwrap().state,
                JobExecutionState::Starting
            );
        });
    }

    #[test]
    fn test_locks_are_exclusive_until_released() {
        tokio_test::block_on(async {
            let (queue_id, registry) = registry_with_queue();
            let record = scheduled_record(queue_id, Uuid::new_v4(), "QueryWorkflow");
            let job_id = record.id;
            registry.insert_job(record);

            let first = Uuid::new_v4();
            let second = Uuid::new_v4();

            registry.obtain_lock(job_id, first).await.unwrap();
            // Re-entrant for the same owner, exclusive against others.
            registry.obtain_lock(job_id, first).await.unwrap();
            assert!(registry.obtain_lock(job_id, second).await.is_err());

            registry.release_lock(job_id, false).await.unwrap();
            registry.obtain_lock(job_id, second).await.unwrap();
        });
    }

    #[test]
    fn test_reschedule_only_applies_to_recurring_jobs() {
        tokio_test::block_on(async {
            let (queue_id, registry) = registry_with_queue();

            let plain = scheduled_record(queue_id, Uuid::new_v4(), "QueryWorkflow");
            let plain_id = plain.id;
            registry.insert_job(plain);

            let mut recurring = scheduled_record(queue_id, Uuid::new_v4(), "BackupWorkflow");
            recurring.recurring = true;
            let recurring_id = recurring.id;
            registry.insert_job(recurring);

            registry.reschedule_if_recurring(plain_id).await.unwrap();
            assert_eq!(registry.job_count(), 2);

            registry.reschedule_if_recurring(recurring_id).await.unwrap();
            assert_eq!(registry.job_count(), 3);
        });
    }
}
