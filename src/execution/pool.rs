//! Execution host pool.
//!
//! One live host per distinct workload type, created on demand and retired
//! when idle past a threshold, faulted, or at shutdown. Sandbox reuse
//! amortizes workload load cost across jobs of the same type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::execution::events::HostEventSink;
use crate::execution::host::{ExecutionHost, WorkloadFactory};
use crate::models::{Job, JobStatus, LaunchMode};

/// Manages the set of live execution hosts.
pub struct ExecutionHostPool {
    factory: Arc<dyn WorkloadFactory>,
    sink: Arc<dyn HostEventSink>,
    hosts: Mutex<HashMap<Uuid, Arc<ExecutionHost>>>,
}

impl ExecutionHostPool {
    pub fn new(factory: Arc<dyn WorkloadFactory>, sink: Arc<dyn HostEventSink>) -> Self {
        Self {
            factory,
            sink,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live, healthy host for a workload type, creating and
    /// starting one when none exists.
    pub fn get_or_create(&self, workflow_type: &str) -> Result<Arc<ExecutionHost>> {
        let mut hosts = self.hosts.lock();

        if let Some(host) = hosts
            .values()
            .find(|h| h.workload_type() == workflow_type && !h.is_faulted())
        {
            return Ok(Arc::clone(host));
        }

        let workload = self.factory.create(workflow_type)?;
        let host = Arc::new(ExecutionHost::new(
            workflow_type,
            workload,
            Arc::clone(&self.sink),
        ));
        debug!(host_id = %host.id(), workflow_type, "Created execution host");
        hosts.insert(host.id(), Arc::clone(&host));
        Ok(host)
    }

    /// Prepare and launch a claimed job; fills in run id, host id, start
    /// time and flips the status to `Executing`.
    pub fn dispatch(&self, job: &mut Job) -> Result<()> {
        let host = self.get_or_create(&job.workflow_type)?;

        let run_id = match job.launch_mode() {
            LaunchMode::Start => host.prepare_start(job)?,
            LaunchMode::Resume => host.prepare_resume(job)?,
        };

        job.run_id = Some(run_id);
        job.host_id = Some(host.id());
        job.started_at = Some(Utc::now());
        job.status = JobStatus::Executing;

        host.run_job(job.clone())
    }

    pub fn cancel(&self, job: &Job) -> Result<()> {
        self.host_for(job)?.cancel_job(job.id)
    }

    pub fn time_out(&self, job: &Job) -> Result<()> {
        self.host_for(job)?.time_out_job(job.id)
    }

    pub fn persist(&self, job: &Job) -> Result<()> {
        self.host_for(job)?.persist_job(job.id)
    }

    fn host_for(&self, job: &Job) -> Result<Arc<ExecutionHost>> {
        let host_id = job
            .host_id
            .ok_or_else(|| SchedulerError::Host(format!("job {} has no host assigned", job.id)))?;

        self.hosts
            .lock()
            .get(&host_id)
            .cloned()
            .ok_or_else(|| SchedulerError::Host(format!("host {host_id} is not in the pool")))
    }

    /// Retire hosts that are faulted, or idle past `idle_threshold`.
    pub async fn retire_idle(&self, idle_threshold: Duration, stop_timeout: Duration) {
        let candidates: Vec<Arc<ExecutionHost>> = {
            let mut hosts = self.hosts.lock();
            let ids: Vec<Uuid> = hosts
                .values()
                .filter(|h| h.is_faulted() || h.is_idle(idle_threshold))
                .map(|h| h.id())
                .collect();
            ids.into_iter().filter_map(|id| hosts.remove(&id)).collect()
        };

        for host in candidates {
            info!(
                host_id = %host.id(),
                workflow_type = host.workload_type(),
                faulted = host.is_faulted(),
                "Retiring execution host"
            );
            host.stop(stop_timeout).await;
        }
    }

    /// Stop and remove every host, waiting up to `timeout` per host for its
    /// jobs to wind down.
    pub async fn retire_all(&self, timeout: Duration) {
        let hosts: Vec<Arc<ExecutionHost>> = self.hosts.lock().drain().map(|(_, h)| h).collect();

        for host in hosts {
            host.stop(timeout).await;
        }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.lock().len()
    }
}
