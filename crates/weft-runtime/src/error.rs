//! Error types for the weft scheduler.

use thiserror::Error;

/// Errors returned by scheduler operations.
///
/// Apart from `Aborted`, these are misuse errors: the caller broke the
/// scheduler's calling contract and retrying will not help.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// `start()` was called while the scheduler was already running.
    #[error("call to start with a scheduler already running")]
    AlreadyRunning,

    /// `yield_now()` was called outside of any scheduler task.
    #[error("call to yield outside of a scheduler task")]
    NotInTask,

    /// `yield_now()` was called from a plain task.
    #[error("call to yield outside of a coroutine")]
    NotCoroutine,

    /// The calling task belongs to a different scheduler.
    #[error("current task belongs to another scheduler")]
    ForeignScheduler,

    /// The current coroutine was aborted; returned from `yield_now()`.
    #[error("task aborted, could not yield")]
    Aborted,

    /// `join()` was called from a thread dispatching for the same scheduler.
    #[error("cannot join the pool from one of its own dispatcher threads")]
    JoinFromWorker,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Reason attached to a task that ended in the aborted state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task was cancelled through `abort()`.
    #[error("task was cancelled")]
    Cancelled,

    /// The callback returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The callback panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task could not be given a stack or a worker to run on.
    #[error("failed to start task: {0}")]
    SpawnFailed(String),
}

/// Turn a panic payload into a readable message.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::NotCoroutine;
        assert_eq!(err.to_string(), "call to yield outside of a coroutine");

        let err = TaskError::Panicked("something went wrong".to_string());
        assert_eq!(err.to_string(), "task panicked: something went wrong");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
