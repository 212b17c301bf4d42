#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Scheduler Core
//!
//! Core engine of a distributed job scheduler: polls a shared registry
//! across a cluster of queues, dispatches runnable jobs into isolated
//! execution hosts, tracks their lifecycle and reconciles state after
//! crashes.
//!
//! ## Architecture
//!
//! A [`QueueManager`](orchestration::QueueManager) is constructed once per
//! process and owns the whole engine: the immutable cluster topology, the
//! coarse-locked job [`Bookkeeping`](orchestration::Bookkeeping), the
//! [`ExecutionHostPool`](execution::ExecutionHostPool) and the poller task.
//! The registry is the single source of truth for job ownership; the
//! conditional `mark_starting` update is what keeps two scheduler
//! instances from dispatching the same job.
//!
//! The workflow engine itself is opaque: implement
//! [`JobWorkload`](execution::JobWorkload) and a
//! [`WorkloadFactory`](execution::WorkloadFactory) and the scheduler runs
//! your workloads inside per-type execution hosts, signalling cancel,
//! timeout and persist cooperatively.
//!
//! ## Module Organization
//!
//! - [`models`] - jobs, persisted states, cluster topology
//! - [`registry`] - registry client trait and Postgres implementation
//! - [`execution`] - execution hosts, host pool and completion events
//! - [`orchestration`] - queue manager, poller loop, bookkeeping, recovery
//! - [`config`] - configuration loading and the startup sanity check
//! - [`error`] - structured error handling
//! - [`logging`] - tracing initialization
//! - [`test_helpers`] - in-memory registry and scripted workloads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use scheduler_core::config::SchedulerConfig;
//! use scheduler_core::orchestration::QueueManager;
//! use scheduler_core::registry::PgJobRegistry;
//! use scheduler_core::test_helpers::{CompletingWorkload, UniformFactory};
//!
//! # async fn example() -> scheduler_core::Result<()> {
//! let config = SchedulerConfig::load()?;
//! let registry = Arc::new(PgJobRegistry::connect(&config.database_url).await?);
//! let factory = Arc::new(UniformFactory::new(Arc::new(CompletingWorkload)));
//!
//! let mut manager = QueueManager::new(config, registry, factory);
//! manager.start(true).await?;
//! // ... serve until shutdown is requested ...
//! manager.stop(Duration::from_secs(3600)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod test_helpers;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use execution::{
    CompletionKind, ControlSignal, ExecutionHostPool, HostEventSink, JobCompletionEvent,
    JobWorkload, SignalReceiver, WorkloadFactory,
};
pub use models::{
    ClusterTopology, Job, JobExecutionState, JobFilter, JobRecord, JobStatus, LaunchMode,
    QueueDefinition,
};
pub use orchestration::{Bookkeeping, QueueManager, SchedulerContext};
pub use registry::{JobRegistry, PgJobRegistry};
