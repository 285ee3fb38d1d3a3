//! Task core of the EOS kernel
//!
//! Priority scheduling of independently stacked tasks on a single core:
//! the task table, the multi-level ready queue, the scheduler proper, the
//! wait/wakeup and sleep primitives, and the context switch engine they
//! all sit on.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::fmt;

pub mod config;
pub mod context_switch;
mod error;
mod ready_queue;
mod scheduler;
mod task;
mod wait;

pub use error::{KernelResult, TaskError};
pub use ready_queue::ReadyBitmap;
pub use scheduler::{
    change_priority, create_task, destroy_task, dump_context, get_current_task, get_period,
    get_priority, highest_ready_priority, init, resume_task, schedule, set_period, shutdown,
    start, suspend_task, task_info,
};
pub use task::{Residence, TaskInfo};
pub use wait::{
    sleep, ticks, timer_tick, wait, wakeup_all, wakeup_single, wakeup_sleeping_task, WaitQueue,
    WakePolicy,
};

/// Entry routine of a task. Tasks never return; they block, loop or call
/// [`shutdown`].
pub type TaskEntry = fn(arg: usize) -> !;

/// Handle to a task table slot.
///
/// The generation changes every time the slot is freed, so an id kept past
/// `destroy_task` is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    pub(crate) const fn new(index: u32, generation: u32) -> TaskId {
        TaskId { index, generation }
    }

    /// Slot number in the task table
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.index, self.generation)
    }
}

/// An enum describing the state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued in its priority bucket
    Ready,
    /// Owns the processor
    Running,
    /// Blocked on a wait queue, asleep, or suspended
    Waiting,
}

/// Scheduling priority, 0 being the most urgent level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    /// Level reserved for the idle task
    pub const LOWEST: Priority = Priority(config::LOWEST_PRIORITY);

    /// Validates a raw level
    pub const fn new(level: u8) -> KernelResult<Priority> {
        if level > config::LOWEST_PRIORITY {
            Err(TaskError::InvalidPriority(level))
        } else {
            Ok(Priority(level))
        }
    }

    pub(crate) const fn from_level(level: u8) -> Priority {
        assert!(level <= config::LOWEST_PRIORITY);
        Priority(level)
    }

    pub const fn level(self) -> u8 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bounds() {
        assert_eq!(Priority::new(0), Ok(Priority::HIGHEST));
        assert_eq!(Priority::new(config::LOWEST_PRIORITY), Ok(Priority::LOWEST));
        assert_eq!(
            Priority::new(config::LOWEST_PRIORITY + 1),
            Err(TaskError::InvalidPriority(config::LOWEST_PRIORITY + 1))
        );
        assert!(Priority::HIGHEST < Priority::LOWEST);
    }

    #[test]
    fn task_id_display() {
        assert_eq!(alloc::format!("{}", TaskId::new(3, 7)), "task#3.7");
    }
}
