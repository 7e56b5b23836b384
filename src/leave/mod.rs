//! Async no-wait-state leave: batched join evaluation for bursty completions.

pub mod queue;
pub mod task;

pub use queue::{DeferredLeaveJob, JobId, JobState, LeaveQueue, MemoryLeaveQueue};
pub use task::{LeaveTask, spawn_leave_task};
