//! Join point over a set of tasks.
//!
//! A `TaskGroup` counts its members as they reach a terminal state,
//! through the same completion and cancellation handlers every task
//! carries. It owns no thread: [`TaskGroup::wait`] yields the calling
//! coroutine until the count is complete.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::context;
use crate::error::SchedulerError;
use crate::task::TaskHandle;

struct Settled {
    /// Members that reached a terminal state.
    finished: AtomicUsize,
    lock: Mutex<()>,
    changed: Condvar,
}

impl Settled {
    fn record(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }
}

/// A set of tasks awaited together.
pub struct TaskGroup {
    tasks: Vec<TaskHandle>,
    settled: Arc<Settled>,
}

impl TaskGroup {
    /// Create a group over `tasks`.
    pub fn new(tasks: impl IntoIterator<Item = TaskHandle>) -> Self {
        let mut group = Self {
            tasks: Vec::new(),
            settled: Arc::new(Settled {
                finished: AtomicUsize::new(0),
                lock: Mutex::new(()),
                changed: Condvar::new(),
            }),
        };
        for task in tasks {
            group.attach(task);
        }
        group
    }

    /// Add a task to the group.
    ///
    /// A task that already finished or was aborted counts immediately.
    pub fn attach(&mut self, task: TaskHandle) {
        let on_complete = Arc::clone(&self.settled);
        task.add_completion_handler(move || on_complete.record());
        let on_cancel = Arc::clone(&self.settled);
        task.add_cancellation_handler(move || on_cancel.record());
        self.tasks.push(task);
    }

    /// Number of attached tasks.
    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is attached.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of attached tasks that reached a terminal state.
    pub fn finished_count(&self) -> usize {
        self.settled.finished.load(Ordering::SeqCst)
    }

    /// Check if every attached task has settled.
    pub fn is_complete(&self) -> bool {
        self.finished_count() >= self.size()
    }

    /// The attached tasks, in attach order.
    pub fn tasks(&self) -> &[TaskHandle] {
        &self.tasks
    }

    /// Abort every member that has not settled yet. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        self.tasks.iter().filter(|task| task.abort()).count()
    }

    /// Yield the calling coroutine until every attached task has settled.
    ///
    /// Fails outside a coroutine, or if the calling coroutine is aborted
    /// while waiting.
    pub fn wait(&self) -> Result<(), SchedulerError> {
        context::ensure_can_yield()?;
        while !self.is_complete() {
            context::yield_now()?;
        }
        Ok(())
    }

    /// Block the calling thread until every attached task has settled.
    pub fn wait_blocking(&self) {
        let mut guard = self.settled.lock.lock();
        while !self.is_complete() {
            self.settled.changed.wait(&mut guard);
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FromIterator<TaskHandle> for TaskGroup {
    fn from_iter<I: IntoIterator<Item = TaskHandle>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("size", &self.size())
            .field("finished", &self.finished_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use crate::task::{boxed_body, PlainTask};
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Duration;

    fn plain() -> TaskHandle {
        TaskHandle::new(Arc::new(PlainTask::new(boxed_body(|| {}))))
    }

    fn run(handle: &TaskHandle) {
        let task = handle.task();
        task.create();
        task.enter();
        task.exit();
    }

    #[test]
    fn test_counts_settled_members() {
        let tasks: Vec<_> = (0..3).map(|_| plain()).collect();
        let group = TaskGroup::new(tasks.clone());
        assert_eq!(group.size(), 3);
        assert_eq!(group.finished_count(), 0);

        run(&tasks[0]);
        tasks[1].abort();
        assert_eq!(group.finished_count(), 2);
        assert!(!group.is_complete());

        run(&tasks[2]);
        assert!(group.is_complete());
    }

    #[test]
    fn test_attach_terminal_tasks() {
        let finished = plain();
        run(&finished);
        let aborted = plain();
        aborted.abort();
        let pending = plain();

        let mut group = TaskGroup::default();
        group.attach(finished);
        group.attach(aborted);
        group.attach(pending.clone());
        assert_eq!(group.finished_count(), 2);

        run(&pending);
        assert_eq!(group.finished_count(), 3);
        assert!(group.is_complete());
    }

    #[test]
    fn test_abort_is_counted_once() {
        let task = plain();
        let group: TaskGroup = std::iter::once(task.clone()).collect();
        task.abort();
        task.abort();
        run(&task);
        assert_eq!(group.finished_count(), 1);
        assert_eq!(task.status(), Status::Aborted);
    }

    #[test]
    fn test_abort_all() {
        let tasks: Vec<_> = (0..4).map(|_| plain()).collect();
        run(&tasks[0]);
        let group = TaskGroup::new(tasks);
        assert_eq!(group.abort_all(), 3);
        assert!(group.is_complete());
    }

    #[test]
    fn test_empty_group_is_complete() {
        let group = TaskGroup::default();
        assert!(group.is_empty());
        assert!(group.is_complete());
        group.wait_blocking();
    }

    #[test]
    fn test_wait_outside_coroutine_fails() {
        let group = TaskGroup::new(vec![plain()]);
        assert_eq!(group.wait(), Err(SchedulerError::NotInTask));
    }

    #[test]
    fn test_wait_blocking_from_other_thread() {
        let task = plain();
        let group = TaskGroup::new(vec![task.clone()]);
        let runner = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            run(&task);
        });
        group.wait_blocking();
        assert!(group.is_complete());
        runner.join().unwrap();
    }
}
