//! Errors reported by the task core

use core::fmt;

use crate::{context_switch::StackTooSmall, TaskId, TaskState};

/// Result type of every fallible kernel operation
pub type KernelResult<T> = Result<T, TaskError>;

/// Recoverable failures of lifecycle and blocking operations.
///
/// Contract violations at the architecture boundary (resuming a stale
/// context, an empty ready set while the running task blocks) are not
/// represented here; they are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// `init` has not been called yet
    NotInitialized,
    /// Every slot of the task table is taken
    TaskTableFull,
    /// The task table could not be reserved at init
    OutOfMemory,
    /// The stack block cannot hold the initial context
    StackTooSmall { provided: usize, required: usize },
    /// Priority outside `0..=LOWEST_PRIORITY`
    InvalidPriority(u8),
    /// The id does not name a live task (never created or destroyed)
    NoSuchTask(TaskId),
    /// The operation is not allowed in the task's current state
    InvalidState { task: TaskId, state: TaskState },
    /// A blocking call was made outside of any task
    NoCurrentTask,
    /// `start` was called while tasks are already being dispatched
    AlreadyStarted,
    /// No task is ready at the lowest priority to act as idle task
    NoIdleTask,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::NotInitialized => write!(f, "task module not initialized"),
            TaskError::TaskTableFull => write!(f, "task table full"),
            TaskError::OutOfMemory => write!(f, "out of memory for the task table"),
            TaskError::StackTooSmall { provided, required } => write!(
                f,
                "stack of {} bytes is too small, at least {} required",
                provided, required
            ),
            TaskError::InvalidPriority(p) => write!(f, "invalid priority {}", p),
            TaskError::NoSuchTask(id) => write!(f, "no such task {}", id),
            TaskError::InvalidState { task, state } => {
                write!(f, "{} cannot do that while {:?}", task, state)
            }
            TaskError::NoCurrentTask => write!(f, "no task is running"),
            TaskError::AlreadyStarted => write!(f, "scheduler already started"),
            TaskError::NoIdleTask => write!(f, "no idle task at the lowest priority"),
        }
    }
}

impl From<StackTooSmall> for TaskError {
    fn from(err: StackTooSmall) -> Self {
        TaskError::StackTooSmall {
            provided: err.provided,
            required: err.required,
        }
    }
}
