//! Priority-aware task scheduling with per-queue concurrency caps.

mod scheduler;
mod task;

pub use scheduler::{SchedulerLimits, SchedulerStats, TaskScheduler, TaskTicket};
pub use task::{
    Priority, ResourceType, TaskEvent, TaskEventKind, TaskId, TaskOutcome, TaskSpec, TaskStatus,
    TaskType, TaskValue,
};
