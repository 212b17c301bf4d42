//! Execution host: one isolated sandbox running jobs of a single workload
//! type.
//!
//! The isolation mechanism is an in-process task group driving an injected
//! [`JobWorkload`]; the contract that matters is create-on-demand, retire
//! when idle, and fault isolation: a panic inside a workload marks the
//! whole host faulted and every job it runs is failed, never stranded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::execution::events::{CompletionKind, HostEventSink};
use crate::models::{Job, LaunchMode};

/// Cooperative control signal delivered to a running workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Stop as soon as possible; report `Cancelled`.
    Cancel,
    /// Stop as soon as possible; report `TimedOut`.
    TimeOut,
    /// Checkpoint state and stop; report `Persisted`.
    Persist,
}

/// Receiving end of a job's control channel, handed to the workload.
pub struct SignalReceiver {
    rx: mpsc::UnboundedReceiver<ControlSignal>,
}

impl SignalReceiver {
    /// Wait for the next control signal. Returns `None` once the host has
    /// dropped the sending side (host teardown).
    pub async fn recv(&mut self) -> Option<ControlSignal> {
        self.rx.recv().await
    }

    /// Non-blocking check for a pending signal.
    pub fn try_recv(&mut self) -> Option<ControlSignal> {
        self.rx.try_recv().ok()
    }
}

/// The opaque workflow engine. Implementations run one job to a terminal
/// event, honoring control signals cooperatively.
///
/// Returning `Err` fails that single job; panicking is treated as a host
/// fault and takes down every job in the host.
#[async_trait]
pub trait JobWorkload: Send + Sync + 'static {
    async fn execute(
        &self,
        job: Job,
        mode: LaunchMode,
        signals: SignalReceiver,
    ) -> Result<CompletionKind>;
}

/// Creates workload engines, one per distinct workload type. The returned
/// engine is shared by every job the host runs.
pub trait WorkloadFactory: Send + Sync + 'static {
    fn create(&self, workflow_type: &str) -> Result<Arc<dyn JobWorkload>>;
}

struct PendingRun {
    run_id: Uuid,
    mode: LaunchMode,
    rx: mpsc::UnboundedReceiver<ControlSignal>,
}

struct HostShared {
    id: Uuid,
    faulted: AtomicBool,
    last_active: Mutex<Instant>,
    /// Control-signal senders for jobs currently running, by job id.
    signals: Mutex<HashMap<Uuid, mpsc::UnboundedSender<ControlSignal>>>,
    /// Prepared but not yet launched runs, by job id.
    pending: Mutex<HashMap<Uuid, PendingRun>>,
    /// Join handles for launched runs, by run id. Pruned lazily.
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

/// Handle to one live execution sandbox.
pub struct ExecutionHost {
    shared: Arc<HostShared>,
    workload_type: String,
    workload: Arc<dyn JobWorkload>,
    sink: Arc<dyn HostEventSink>,
}

impl ExecutionHost {
    pub fn new(
        workflow_type: &str,
        workload: Arc<dyn JobWorkload>,
        sink: Arc<dyn HostEventSink>,
    ) -> Self {
        Self {
            shared: Arc::new(HostShared {
                id: Uuid::new_v4(),
                faulted: AtomicBool::new(false),
                last_active: Mutex::new(Instant::now()),
                signals: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
            workload_type: workflow_type.to_string(),
            workload,
            sink,
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn workload_type(&self) -> &str {
        &self.workload_type
    }

    pub fn is_faulted(&self) -> bool {
        self.shared.faulted.load(Ordering::Acquire)
    }

    /// Number of jobs currently running inside this host.
    pub fn running_jobs(&self) -> usize {
        self.shared.signals.lock().len()
    }

    /// Zero running jobs and no activity for longer than `threshold`.
    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.running_jobs() == 0 && self.shared.last_active.lock().elapsed() > threshold
    }

    /// Allocate a run id for a fresh start of `job`.
    pub fn prepare_start(&self, job: &Job) -> Result<Uuid> {
        self.prepare(job, LaunchMode::Start)
    }

    /// Allocate a run id for resuming `job` from its checkpoint.
    pub fn prepare_resume(&self, job: &Job) -> Result<Uuid> {
        self.prepare(job, LaunchMode::Resume)
    }

    fn prepare(&self, job: &Job, mode: LaunchMode) -> Result<Uuid> {
        if self.is_faulted() {
            return Err(SchedulerError::Host(format!(
                "host {} is faulted and accepts no new jobs",
                self.shared.id
            )));
        }

        self.prune_finished_tasks();
        self.touch();

        let run_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.shared.signals.lock().insert(job.id, tx);
        self.shared
            .pending
            .lock()
            .insert(job.id, PendingRun { run_id, mode, rx });

        Ok(run_id)
    }

    /// Launch a prepared job. The workload runs on its own task; its
    /// terminal outcome is reported through the sink, a panic marks the
    /// host faulted.
    pub fn run_job(&self, job: Job) -> Result<()> {
        let pending = self.shared.pending.lock().remove(&job.id).ok_or_else(|| {
            SchedulerError::Host(format!("job {} was not prepared on host {}", job.id, self.shared.id))
        })?;

        let job_id = job.id;
        let run_id = pending.run_id;
        let workload = Arc::clone(&self.workload);
        let sink = Arc::clone(&self.sink);
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            let signals = SignalReceiver { rx: pending.rx };
            let outcome = std::panic::AssertUnwindSafe(workload.execute(job, pending.mode, signals))
                .catch_unwind()
                .await;

            shared.signals.lock().remove(&job_id);
            *shared.last_active.lock() = Instant::now();

            match outcome {
                Ok(Ok(kind)) => sink.job_completed(run_id, kind, None),
                Ok(Err(err)) => sink.job_completed(
                    run_id,
                    CompletionKind::Failed,
                    Some(err.innermost_message()),
                ),
                Err(panic) => {
                    shared.faulted.store(true, Ordering::Release);
                    sink.host_faulted(shared.id, &panic_message(panic.as_ref()));
                }
            }
        });

        self.shared.tasks.lock().insert(run_id, handle);
        Ok(())
    }

    pub fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        self.signal(job_id, ControlSignal::Cancel)
    }

    pub fn time_out_job(&self, job_id: Uuid) -> Result<()> {
        self.signal(job_id, ControlSignal::TimeOut)
    }

    pub fn persist_job(&self, job_id: Uuid) -> Result<()> {
        self.signal(job_id, ControlSignal::Persist)
    }

    fn signal(&self, job_id: Uuid, signal: ControlSignal) -> Result<()> {
        self.touch();

        let senders = self.shared.signals.lock();
        let tx = senders.get(&job_id).ok_or_else(|| {
            SchedulerError::Host(format!("job {job_id} is not hosted on {}", self.shared.id))
        })?;

        tx.send(signal).map_err(|_| {
            SchedulerError::Host(format!("job {job_id} no longer accepts signals"))
        })
    }

    /// Wait up to `timeout` for running jobs to finish, then abort whatever
    /// is left. Completion events for aborted runs never arrive; callers
    /// fail or persist those jobs through other paths before stopping.
    pub async fn stop(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        while self.running_jobs() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let leftover: Vec<(Uuid, JoinHandle<()>)> =
            self.shared.tasks.lock().drain().collect();

        for (run_id, handle) in leftover {
            if !handle.is_finished() {
                warn!(host_id = %self.shared.id, run_id = %run_id, "Aborting job run at host stop");
                handle.abort();
            }
        }

        self.shared.signals.lock().clear();
        self.shared.pending.lock().clear();
        debug!(host_id = %self.shared.id, "Execution host stopped");
    }

    fn touch(&self) {
        *self.shared.last_active.lock() = Instant::now();
    }

    fn prune_finished_tasks(&self) {
        self.shared.tasks.lock().retain(|_, handle| !handle.is_finished());
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "workload panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::JobCompletionEvent;
    use chrono::Utc;
    use crate::models::JobStatus;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<JobCompletionEvent>>,
        faults: Mutex<Vec<(Uuid, String)>>,
    }

    impl HostEventSink for RecordingSink {
        fn job_completed(&self, run_id: Uuid, kind: CompletionKind, error_message: Option<String>) {
            self.events.lock().push(JobCompletionEvent {
                run_id,
                kind,
                error_message,
            });
        }

        fn host_faulted(&self, host_id: Uuid, error_message: &str) {
            self.faults.lock().push((host_id, error_message.to_string()));
        }
    }

    struct ImmediateWorkload;

    #[async_trait]
    impl JobWorkload for ImmediateWorkload {
        async fn execute(
            &self,
            _job: Job,
            _mode: LaunchMode,
            _signals: SignalReceiver,
        ) -> Result<CompletionKind> {
            Ok(CompletionKind::Completed)
        }
    }

    struct SignalledWorkload;

    #[async_trait]
    impl JobWorkload for SignalledWorkload {
        async fn execute(
            &self,
            _job: Job,
            _mode: LaunchMode,
            mut signals: SignalReceiver,
        ) -> Result<CompletionKind> {
            Ok(match signals.recv().await {
                Some(ControlSignal::Cancel) => CompletionKind::Cancelled,
                Some(ControlSignal::TimeOut) => CompletionKind::TimedOut,
                Some(ControlSignal::Persist) => CompletionKind::Persisted,
                None => CompletionKind::Cancelled,
            })
        }
    }

    struct PanickingWorkload;

    #[async_trait]
    impl JobWorkload for PanickingWorkload {
        async fn execute(
            &self,
            _job: Job,
            _mode: LaunchMode,
            _signals: SignalReceiver,
        ) -> Result<CompletionKind> {
            panic!("sandbox corrupted");
        }
    }

    fn test_job() -> Job {
        Job {
            id: Uuid::new_v4(),
            run_id: None,
            queue_id: Uuid::new_v4(),
            host_id: None,
            user_id: Uuid::new_v4(),
            user_name: "carol".to_string(),
            cluster_id: Uuid::new_v4(),
            domain_id: Uuid::new_v4(),
            federation_id: Uuid::new_v4(),
            name: "spectra".to_string(),
            external_id: 1,
            workflow_type: "TestWorkflow".to_string(),
            scheduled_at: Some(Utc::now()),
            started_at: None,
            timeout: None,
            status: JobStatus::Starting,
            cancel_requested: false,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_run_reports_completion() {
        let sink = Arc::new(RecordingSink::default());
        let host = ExecutionHost::new("TestWorkflow", Arc::new(ImmediateWorkload), sink.clone());

        let job = test_job();
        let run_id = host.prepare_start(&job).unwrap();
        host.run_job(job).unwrap();

        wait_for(|| !sink.events.lock().is_empty()).await;

        let events = sink.events.lock();
        assert_eq!(events[0].run_id, run_id);
        assert_eq!(events[0].kind, CompletionKind::Completed);
        assert!(events[0].error_message.is_none());
    }

    #[tokio::test]
    async fn test_cancel_signal_reaches_workload() {
        let sink = Arc::new(RecordingSink::default());
        let host = ExecutionHost::new("TestWorkflow", Arc::new(SignalledWorkload), sink.clone());

        let job = test_job();
        let job_id = job.id;
        host.prepare_start(&job).unwrap();
        host.run_job(job).unwrap();

        wait_for(|| host.running_jobs() == 1).await;
        host.cancel_job(job_id).unwrap();

        wait_for(|| !sink.events.lock().is_empty()).await;
        assert_eq!(sink.events.lock()[0].kind, CompletionKind::Cancelled);
        assert_eq!(host.running_jobs(), 0);
    }

    #[tokio::test]
    async fn test_panic_marks_host_faulted() {
        let sink = Arc::new(RecordingSink::default());
        let host = ExecutionHost::new("TestWorkflow", Arc::new(PanickingWorkload), sink.clone());

        let job = test_job();
        host.prepare_start(&job).unwrap();
        host.run_job(job).unwrap();

        wait_for(|| host.is_faulted()).await;

        let faults = sink.faults.lock();
        assert_eq!(faults[0].0, host.id());
        assert_eq!(faults[0].1, "sandbox corrupted");

        // A faulted host refuses further work.
        assert!(host.prepare_start(&test_job()).is_err());
    }

    #[tokio::test]
    async fn test_signal_unknown_job_is_an_error() {
        let sink = Arc::new(RecordingSink::default());
        let host = ExecutionHost::new("TestWorkflow", Arc::new(ImmediateWorkload), sink);
        assert!(host.cancel_job(Uuid::new_v4()).is_err());
    }
}
