//! Thread-local execution context.
//!
//! A dispatcher records the task it is stepping for the duration of one
//! dispatch step through [`CurrentGuard`], so the record can never leak
//! into the next step.
//!
//! A coroutine may resume on a different thread than the one it
//! suspended on, so the accessors below are never inlined: every lookup
//! re-reads the thread-local of the thread currently running the stack.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::coroutine::Yielder;
use crate::error::SchedulerError;
use crate::task::TaskId;

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
    static DISPATCHER: Cell<u64> = const { Cell::new(0) };
}

/// The task executing on this thread.
#[derive(Clone)]
pub(crate) struct Current {
    pub(crate) scheduler: u64,
    pub(crate) task: TaskId,
    /// Present only for coroutine tasks.
    pub(crate) yielder: Option<Arc<Yielder>>,
}

/// Restores the previous current task when dropped.
pub(crate) struct CurrentGuard {
    prev: Option<Current>,
}

impl CurrentGuard {
    pub(crate) fn enter(current: Current) -> Self {
        let prev = CURRENT.with(|cell| cell.borrow_mut().replace(current));
        Self { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cell| *cell.borrow_mut() = prev);
    }
}

/// Marks this thread as dispatching for a scheduler.
pub(crate) struct DispatcherGuard {
    prev: u64,
}

impl DispatcherGuard {
    pub(crate) fn enter(scheduler: u64) -> Self {
        let prev = DISPATCHER.with(|cell| cell.replace(scheduler));
        Self { prev }
    }
}

impl Drop for DispatcherGuard {
    fn drop(&mut self) {
        DISPATCHER.with(|cell| cell.set(self.prev));
    }
}

/// Whether this thread is dispatching for `scheduler`.
#[inline(never)]
pub(crate) fn is_dispatching_for(scheduler: u64) -> bool {
    DISPATCHER.with(|cell| cell.get()) == scheduler
}

#[inline(never)]
pub(crate) fn current() -> Option<Current> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Suspend the current coroutine and return control to its dispatcher.
///
/// Fails with [`SchedulerError::NotInTask`] outside of any task,
/// [`SchedulerError::NotCoroutine`] inside a plain task, and
/// [`SchedulerError::Aborted`] once the coroutine has been aborted. An
/// aborted coroutine should propagate that error so its body can unwind.
pub fn yield_now() -> Result<(), SchedulerError> {
    let current = current().ok_or(SchedulerError::NotInTask)?;
    let yielder = current.yielder.ok_or(SchedulerError::NotCoroutine)?;
    yielder.suspend()
}

/// Check that [`yield_now`] may be called on this thread without suspending.
pub(crate) fn ensure_can_yield() -> Result<(), SchedulerError> {
    let current = current().ok_or(SchedulerError::NotInTask)?;
    match current.yielder {
        Some(_) => Ok(()),
        None => Err(SchedulerError::NotCoroutine),
    }
}

/// Whether [`yield_now`] may be called on this thread.
#[inline(never)]
pub fn can_yield() -> bool {
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|current| current.yielder.is_some())
            .unwrap_or(false)
    })
}

/// Identifier of the task running on this thread, if any.
#[inline(never)]
pub fn current_task() -> Option<TaskId> {
    CURRENT.with(|cell| cell.borrow().as_ref().map(|current| current.task))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yield_outside_task() {
        assert_eq!(yield_now(), Err(SchedulerError::NotInTask));
        assert!(!can_yield());
        assert!(current_task().is_none());
    }

    #[test]
    fn test_yield_inside_plain_task() {
        let id = TaskId::new();
        let _guard = CurrentGuard::enter(Current {
            scheduler: 1,
            task: id,
            yielder: None,
        });
        assert_eq!(yield_now(), Err(SchedulerError::NotCoroutine));
        assert_eq!(current_task(), Some(id));
    }

    #[test]
    fn test_guard_restores_previous() {
        let outer = TaskId::new();
        let inner = TaskId::new();
        let _outer = CurrentGuard::enter(Current {
            scheduler: 1,
            task: outer,
            yielder: None,
        });
        {
            let _inner = CurrentGuard::enter(Current {
                scheduler: 1,
                task: inner,
                yielder: None,
            });
            assert_eq!(current_task(), Some(inner));
        }
        assert_eq!(current_task(), Some(outer));
    }

    #[test]
    fn test_dispatcher_marker() {
        assert!(!is_dispatching_for(42));
        {
            let _guard = DispatcherGuard::enter(42);
            assert!(is_dispatching_for(42));
            assert!(!is_dispatching_for(7));
        }
        assert!(!is_dispatching_for(42));
    }
}
