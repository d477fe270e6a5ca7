//! Scheduler loop.
//!
//! Every tick the scheduler:
//! - dispatches an execution for each pending event starting within the
//!   execute horizon
//! - dispatches a watch for each prescaled event starting within the watch
//!   horizon
//! - marks watching events whose end time has passed as succeeded

mod worker;

pub use worker::{SchedulerConfig, SchedulerWorker};
