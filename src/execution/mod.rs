//! Execution hosts: isolated sandboxes running job workloads, the pool
//! managing their lifecycle, and the completion events they report.

pub mod events;
pub mod host;
pub mod pool;

pub use events::{CompletionKind, HostEventSink, JobCompletionEvent};
pub use host::{ControlSignal, ExecutionHost, JobWorkload, SignalReceiver, WorkloadFactory};
pub use pool::ExecutionHostPool;
