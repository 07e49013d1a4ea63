//! Background task scheduler.
//!
//! Tasks carry a [`Schedule`] (cron, fixed interval, or one-shot), run on
//! the shared runtime, and publish `scheduler.task.*` events for every
//! state transition. A single dispatcher drains a min-heap keyed by the
//! next firing time; at most one execution of a task is live at once, and
//! overrun ticks are dropped with a `scheduler.task.overrun` event.

mod scheduler;
mod task;

pub use scheduler::Scheduler;
pub use task::{Schedule, TaskContext, TaskInfo, TaskSpec, TaskStatus};
