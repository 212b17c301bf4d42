//! Job bookkeeping.
//!
//! A single mutex guards every structure here: the job maps, the per-queue
//! and per-host membership sets, and the completion-event queue. Any
//! cross-structure read or mutation happens atomically under that lock, so
//! a job is either present in all of them or in none.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::execution::events::{CompletionKind, HostEventSink, JobCompletionEvent};
use crate::models::{Job, JobStatus};

#[derive(Debug, Default)]
struct QueueBookkeeping {
    running: HashSet<Uuid>,
    /// Owner of the most recently dispatched job; feeds the round-robin
    /// ordering of the next intake.
    last_user_id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs_by_id: HashMap<Uuid, Job>,
    job_ids_by_run_id: HashMap<Uuid, Uuid>,
    queues: HashMap<Uuid, QueueBookkeeping>,
    host_jobs: HashMap<Uuid, HashSet<Uuid>>,
    events: VecDeque<JobCompletionEvent>,
}

/// All in-flight job state owned by this scheduler instance.
pub struct Bookkeeping {
    inner: Mutex<Inner>,
}

impl Bookkeeping {
    pub fn new(queue_ids: Vec<Uuid>) -> Self {
        let mut inner = Inner::default();
        for queue_id in queue_ids {
            inner.queues.insert(queue_id, QueueBookkeeping::default());
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Register a dispatched job in every map. The job must carry its run
    /// id and host id; updates the queue's last-served user so the next
    /// intake favors other users.
    pub fn add_job(&self, job: Job) -> Result<()> {
        let run_id = job.run_id.ok_or_else(|| {
            SchedulerError::InvalidOperation(format!("job {} has no run id", job.id))
        })?;
        let host_id = job.host_id.ok_or_else(|| {
            SchedulerError::InvalidOperation(format!("job {} has no host id", job.id))
        })?;

        let mut inner = self.inner.lock();

        let queue = inner.queues.entry(job.queue_id).or_default();
        queue.running.insert(job.id);
        queue.last_user_id = Some(job.user_id);

        inner.host_jobs.entry(host_id).or_default().insert(job.id);
        inner.job_ids_by_run_id.insert(run_id, job.id);
        inner.jobs_by_id.insert(job.id, job);

        Ok(())
    }

    /// Remove the job a run id refers to from every map. `None` when the
    /// run id is unknown; this is the idempotent path for duplicate or late
    /// completion events.
    pub fn remove_by_run_id(&self, run_id: Uuid) -> Option<Job> {
        let mut inner = self.inner.lock();

        let job_id = inner.job_ids_by_run_id.remove(&run_id)?;
        let job = inner.jobs_by_id.remove(&job_id)?;

        if let Some(queue) = inner.queues.get_mut(&job.queue_id) {
            queue.running.remove(&job_id);
        }
        if let Some(host_id) = job.host_id {
            if let Some(host) = inner.host_jobs.get_mut(&host_id) {
                host.remove(&job_id);
                if host.is_empty() {
                    inner.host_jobs.remove(&host_id);
                }
            }
        }

        Some(job)
    }

    pub fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.inner.lock().jobs_by_id.get(&job_id).cloned()
    }

    /// Update the transient status of a tracked job. Returns false when the
    /// job is no longer tracked (already drained).
    pub fn set_status(&self, job_id: Uuid, status: JobStatus) -> bool {
        match self.inner.lock().jobs_by_id.get_mut(&job_id) {
            Some(job) => {
                job.status = status;
                true
            }
            None => false,
        }
    }

    /// Snapshot of every in-flight job.
    pub fn running_jobs(&self) -> Vec<Job> {
        self.inner.lock().jobs_by_id.values().cloned().collect()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().jobs_by_id.len()
    }

    pub fn queue_in_flight(&self, queue_id: Uuid) -> usize {
        self.inner
            .lock()
            .queues
            .get(&queue_id)
            .map(|q| q.running.len())
            .unwrap_or(0)
    }

    pub fn last_served_user(&self, queue_id: Uuid) -> Option<Uuid> {
        self.inner
            .lock()
            .queues
            .get(&queue_id)
            .and_then(|q| q.last_user_id)
    }

    pub fn push_event(&self, event: JobCompletionEvent) {
        self.inner.lock().events.push_back(event);
    }

    /// Take every queued completion event, oldest first.
    pub fn drain_events(&self) -> Vec<JobCompletionEvent> {
        self.inner.lock().events.drain(..).collect()
    }

    /// Cross-structure consistency: every tracked job appears in exactly
    /// one queue set, exactly one host set, and the run-id index.
    pub fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();

        for (job_id, job) in &inner.jobs_by_id {
            let queue_memberships = inner
                .queues
                .values()
                .filter(|q| q.running.contains(job_id))
                .count();
            let host_memberships = inner
                .host_jobs
                .values()
                .filter(|jobs| jobs.contains(job_id))
                .count();
            let run_indexed = job
                .run_id
                .map(|run_id| inner.job_ids_by_run_id.get(&run_id) == Some(job_id))
                .unwrap_or(false);

            if queue_memberships != 1 || host_memberships != 1 || !run_indexed {
                return false;
            }
        }

        inner.job_ids_by_run_id.len() == inner.jobs_by_id.len()
    }
}

impl HostEventSink for Bookkeeping {
    fn job_completed(&self, run_id: Uuid, kind: CompletionKind, error_message: Option<String>) {
        self.push_event(JobCompletionEvent {
            run_id,
            kind,
            error_message,
        });
    }

    fn host_faulted(&self, host_id: Uuid, error_message: &str) {
        // One lock acquisition: snapshot the host's jobs and queue a Failed
        // event for each, so none of them is stranded.
        let mut inner = self.inner.lock();

        let run_ids: Vec<Uuid> = inner
            .host_jobs
            .get(&host_id)
            .map(|jobs| {
                jobs.iter()
                    .filter_map(|job_id| inner.jobs_by_id.get(job_id))
                    .filter_map(|job| job.run_id)
                    .collect()
            })
            .unwrap_or_default();

        for run_id in run_ids {
            inner.events.push_back(JobCompletionEvent {
                run_id,
                kind: CompletionKind::Failed,
                error_message: Some(error_message.to_string()),
            });
        }
    }
}
