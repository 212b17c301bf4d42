//! Data model: transient jobs, persisted state mirrors and the cluster
//! topology snapshot.

pub mod job;
pub mod states;
pub mod topology;

pub use job::{Job, JobStatus, LaunchMode};
pub use states::{JobExecutionState, JobFilter, JobRecord};
pub use topology::{ClusterTopology, DatabaseDefinition, DatabaseInstance, Machine, QueueDefinition};
