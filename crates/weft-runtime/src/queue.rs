//! Ready queue shared by all dispatchers.
//!
//! A lock-free multi-producer multi-consumer queue of task handles,
//! backed by a crossbeam `Injector`. Any thread may push; every
//! dispatcher steals from the same injector. There is no ordering
//! guarantee across threads.

use crossbeam_deque::{Injector, Steal};

use crate::task::TaskHandle;

pub(crate) struct TaskQueue {
    injector: Injector<TaskHandle>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            injector: Injector::new(),
        }
    }

    pub(crate) fn push(&self, task: TaskHandle) {
        self.injector.push(task);
    }

    pub(crate) fn pop(&self) -> Option<TaskHandle> {
        loop {
            match self.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.injector.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.injector.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
