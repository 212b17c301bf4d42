//! Scheduler orchestration: the queue manager, the poller loop, job
//! bookkeeping and crash recovery.
//!
//! ## Architecture
//!
//! - **QueueManager** owns everything and exposes the control surface
//!   (start, stop, drain-stop, kill, poller pause/resume).
//! - **Poller** runs the five-step tick: timeout scan, intake, cancellation
//!   intake, finished-job draining, idle host reclamation.
//! - **Bookkeeping** is the single coarse-locked view of all in-flight
//!   jobs; execution hosts report completions into it.
//! - **recovery** reconciles jobs a crashed instance left behind, before
//!   polling begins.

pub mod bookkeeping;
pub mod context;
pub mod poller;
pub mod queue_manager;
pub mod recovery;

pub use bookkeeping::Bookkeeping;
pub use context::SchedulerContext;
pub use queue_manager::QueueManager;
pub use recovery::UNEXPECTED_SHUTDOWN_REASON;
