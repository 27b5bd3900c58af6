//! Stackful coroutines.
//!
//! A coroutine owns a separately allocated stack with a guard page and
//! runs in place on whichever dispatcher resumes it: `resume` switches
//! the calling thread onto the coroutine's stack, and `yield_now`
//! switches back. Between suspensions the stack may be picked up by a
//! different worker, so the pool's thread count bounds how many
//! coroutines run at once.
//!
//! # Lifecycle
//!
//! ```text
//! create()  allocate the stack and install the body, not yet started
//! enter()   switch onto the stack; returns when it yields or returns
//! discard() resume once with the abandon flag so a pending yield fails
//!           and the body unwinds, then free the stack
//! ```
//!
//! Thread-local state is looked up afresh after every suspension; a
//! body must not hold values tied to one thread across `yield_now`.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder as StackYielder};
use parking_lot::Mutex;
use tracing::trace;

use crate::context::{Current, CurrentGuard};
use crate::error::{SchedulerError, TaskError};
use crate::status::Status;
use crate::task::{run_body, Body, Task, TaskCore, TaskKind};

/// Resumed with `true` when the coroutine is being abandoned.
type Fiber = Coroutine<bool, (), (), DefaultStack>;

/// A coroutine stack that can be resumed from any dispatcher thread.
struct Stackful(Fiber);

// SAFETY: the body installed on the stack is `Send`, and the stack is only
// ever resumed while holding the owning task's mutex, so exactly one thread
// runs on it at a time.
unsafe impl Send for Stackful {}

impl Stackful {
    /// Run until the next suspension. Returns true once the body has returned.
    fn resume(&mut self, abandon: bool) -> bool {
        if self.0.done() {
            return true;
        }
        matches!(self.0.resume(abandon), CoroutineResult::Return(()))
    }
}

/// Suspension point installed as the current task while a coroutine runs.
pub(crate) struct Yielder {
    core: Arc<TaskCore>,
    /// Points at the switch-back handle living on the coroutine's own stack.
    stack: AtomicPtr<StackYielder<bool, ()>>,
    abandoned: AtomicBool,
}

impl Yielder {
    fn new(core: Arc<TaskCore>) -> Self {
        Self {
            core,
            stack: AtomicPtr::new(ptr::null_mut()),
            abandoned: AtomicBool::new(false),
        }
    }

    fn attach(&self, stack: &StackYielder<bool, ()>) {
        let raw = stack as *const StackYielder<bool, ()> as *mut StackYielder<bool, ()>;
        self.stack.store(raw, Ordering::Release);
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// `Active -> Pending`, switch back to the dispatcher, and come back `Active`.
    pub(crate) fn suspend(&self) -> Result<(), SchedulerError> {
        if self.is_abandoned() || self.core.status() == Status::Aborted {
            return Err(SchedulerError::Aborted);
        }
        let stack = self.stack.load(Ordering::Acquire);
        if stack.is_null() {
            return Err(SchedulerError::NotCoroutine);
        }
        if !self.core.transition(Status::Active, Status::Pending) {
            return Err(SchedulerError::Aborted);
        }
        // SAFETY: `stack` was set by the body running on this coroutine's
        // stack and stays valid until the body returns. The yielder is only
        // reachable through the current-task slot, which is installed just
        // for the duration of a resume, so this call runs on that stack.
        let abandoned = unsafe { &*stack }.suspend(());
        if abandoned {
            self.abandoned.store(true, Ordering::Release);
        }
        if abandoned || self.core.status() == Status::Aborted {
            return Err(SchedulerError::Aborted);
        }
        Ok(())
    }
}

/// A callback executed on its own stack that may suspend itself.
pub(crate) struct CoroutineTask {
    core: Arc<TaskCore>,
    scheduler: u64,
    body: Mutex<Option<Body>>,
    yielder: Arc<Yielder>,
    stack: Mutex<Option<Stackful>>,
    stack_size: usize,
}

impl CoroutineTask {
    pub(crate) fn new(body: Body, scheduler: u64, stack_size: usize) -> Self {
        let core = Arc::new(TaskCore::new(TaskKind::Coroutine));
        let yielder = Arc::new(Yielder::new(Arc::clone(&core)));
        Self {
            core,
            scheduler,
            body: Mutex::new(Some(body)),
            yielder,
            stack: Mutex::new(None),
            stack_size,
        }
    }

    fn current(&self) -> Current {
        Current {
            scheduler: self.scheduler,
            task: self.core.id(),
            yielder: Some(Arc::clone(&self.yielder)),
        }
    }
}

impl Task for CoroutineTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn create(&self) {
        if self.core.status() != Status::Inactive {
            return;
        }
        let Some(body) = self.body.lock().take() else {
            return;
        };

        let stack = match DefaultStack::new(self.stack_size) {
            Ok(stack) => stack,
            Err(err) => {
                self.core.fail(TaskError::SpawnFailed(err.to_string()));
                return;
            }
        };

        let core = Arc::clone(&self.core);
        let yielder = Arc::clone(&self.yielder);
        let entry = move |stack: &StackYielder<bool, ()>, abandoned: bool| {
            yielder.attach(stack);
            if abandoned || core.status() == Status::Aborted {
                drop(body);
                return;
            }
            match run_body(body) {
                Ok(()) => {
                    core.finish();
                }
                Err(reason) => core.fail(reason),
            }
        };
        let fiber = Coroutine::with_stack(stack, entry);

        *self.stack.lock() = Some(Stackful(fiber));
        self.core.transition(Status::Inactive, Status::Created);
        trace!(task = %self.core.id(), stack_size = self.stack_size, "coroutine created");
    }

    fn enter(&self) {
        let resumed = self.core.transition(Status::Created, Status::Active)
            || self.core.transition(Status::Pending, Status::Active);
        if !resumed {
            return;
        }
        self.core.record_dispatch();
        let mut stack = self.stack.lock();
        if let Some(stack) = stack.as_mut() {
            let _current = CurrentGuard::enter(self.current());
            let complete = stack.resume(false);
            trace!(
                task = %self.core.id(),
                complete,
                status = %self.core.status(),
                "coroutine returned control"
            );
        }
    }

    fn discard(&self) {
        drop(self.body.lock().take());
        let stack = self.stack.lock().take();
        if let Some(mut stack) = stack {
            let _current = CurrentGuard::enter(self.current());
            if !stack.resume(true) {
                trace!(task = %self.core.id(), "abandoned coroutine still suspended, forcing unwind");
            }
        }
    }
}

impl Drop for CoroutineTask {
    fn drop(&mut self) {
        self.discard();
    }
}

impl fmt::Debug for CoroutineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineTask")
            .field("core", &self.core)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}
