//! Task types and handles.
//!
//! This module provides:
//! - `TaskId` - Unique identifier for tasks
//! - `TaskHandle` - Shared handle returned by the scheduler
//! - `TaskOutput` - What a task callback may return
//! - the crate-private `Task` contract, its shared `TaskCore`, and
//!   `PlainTask`, the run-to-completion variant
//!
//! Every task settles exactly once. Either its completion handlers run
//! (normal exit) or its cancellation handlers run (abort or failure),
//! never both, each list in insertion order.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::context;
use crate::error::{panic_message, SchedulerError, TaskError};
use crate::status::{AtomicStatus, Status};

/// Zero-argument handler attached to a task.
pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Type-erased task body.
pub(crate) type Body = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Generate a new unique task ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Which variant of task a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Runs its callback to completion in one dispatch step.
    Plain,
    /// Runs its callback on its own stack and may suspend.
    Coroutine,
}

/// Value a task callback may return.
///
/// `()` always finishes the task. An `Err` aborts it with
/// [`TaskError::Failed`] attached.
pub trait TaskOutput {
    /// Convert into the task's outcome.
    fn into_outcome(self) -> Result<(), TaskError>;
}

impl TaskOutput for () {
    fn into_outcome(self) -> Result<(), TaskError> {
        Ok(())
    }
}

impl<E: fmt::Display> TaskOutput for Result<(), E> {
    fn into_outcome(self) -> Result<(), TaskError> {
        self.map_err(|e| TaskError::Failed(e.to_string()))
    }
}

pub(crate) fn boxed_body<F, R>(f: F) -> Body
where
    F: FnOnce() -> R + Send + 'static,
    R: TaskOutput,
{
    Box::new(move || f().into_outcome())
}

/// Run a body, converting a panic into [`TaskError::Panicked`].
pub(crate) fn run_body(body: Body) -> Result<(), TaskError> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(outcome) => outcome,
        Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
    }
}

/// How a task settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Completed,
    Cancelled,
}

#[derive(Default)]
struct Handlers {
    completion: Vec<Callback>,
    cancellation: Vec<Callback>,
    settled: Option<Settlement>,
    /// Set once the handlers taken at settlement have all returned.
    drained: bool,
}

/// State shared by every task variant.
pub(crate) struct TaskCore {
    id: TaskId,
    kind: TaskKind,
    status: AtomicStatus,
    handlers: Mutex<Handlers>,
    /// Signalled once the settling handlers have run.
    settled: Condvar,
    error: Mutex<Option<TaskError>>,
    dispatches: AtomicUsize,
}

impl TaskCore {
    pub(crate) fn new(kind: TaskKind) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            status: AtomicStatus::new(Status::Inactive),
            handlers: Mutex::new(Handlers::default()),
            settled: Condvar::new(),
            error: Mutex::new(None),
            dispatches: AtomicUsize::new(0),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn status(&self) -> Status {
        self.status.load()
    }

    pub(crate) fn transition(&self, from: Status, to: Status) -> bool {
        self.status.transition(from, to)
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    /// `Active -> Finished`. Fails if the task was aborted meanwhile.
    pub(crate) fn finish(&self) -> bool {
        self.status.transition(Status::Active, Status::Finished)
    }

    /// Fire completion handlers if the task finished. Idempotent.
    pub(crate) fn complete(&self) {
        if self.status() == Status::Finished {
            self.settle(Settlement::Completed);
        }
    }

    /// Abort with the given reason. Only the first abort has any effect.
    pub(crate) fn abort_with(&self, reason: TaskError) -> bool {
        if self.status.abort().is_none() {
            return false;
        }
        *self.error.lock() = Some(reason);
        self.settle(Settlement::Cancelled);
        true
    }

    /// Record a failed body outcome.
    pub(crate) fn fail(&self, reason: TaskError) {
        let message = reason.to_string();
        if self.abort_with(reason) {
            warn!(task = %self.id, "{}", message);
        }
    }

    pub(crate) fn error(&self) -> Option<TaskError> {
        self.error.lock().clone()
    }

    fn settle(&self, settlement: Settlement) {
        let callbacks = {
            let mut handlers = self.handlers.lock();
            if handlers.settled.is_some() {
                return;
            }
            handlers.settled = Some(settlement);
            let completion = std::mem::take(&mut handlers.completion);
            let cancellation = std::mem::take(&mut handlers.cancellation);
            match settlement {
                Settlement::Completed => completion,
                Settlement::Cancelled => cancellation,
            }
        };
        for callback in callbacks {
            self.invoke(callback);
        }
        self.handlers.lock().drained = true;
        self.settled.notify_all();
    }

    fn invoke(&self, callback: Callback) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            error!(
                task = %self.id,
                "task handler panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }

    fn add_handler(&self, settlement: Settlement, callback: Callback) {
        let mut handlers = self.handlers.lock();
        match handlers.settled {
            None => match settlement {
                Settlement::Completed => handlers.completion.push(callback),
                Settlement::Cancelled => handlers.cancellation.push(callback),
            },
            Some(settled) if settled == settlement => {
                drop(handlers);
                self.invoke(callback);
            }
            // Settled the other way: this handler can never fire.
            Some(_) => {}
        }
    }

    fn wait_settled(&self, deadline: Option<Instant>) -> bool {
        let mut handlers = self.handlers.lock();
        while !handlers.drained {
            match deadline {
                Some(deadline) => {
                    if self.settled.wait_until(&mut handlers, deadline).timed_out() {
                        return handlers.drained;
                    }
                }
                None => self.settled.wait(&mut handlers),
            }
        }
        true
    }
}

impl fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .finish()
    }
}

/// The contract every schedulable unit implements.
///
/// The dispatcher drives a task through `create`, `enter` (possibly many
/// times for coroutines) and `exit`. `discard` releases whatever an
/// aborted task still holds.
pub(crate) trait Task: Send + Sync {
    fn core(&self) -> &TaskCore;

    /// `Inactive -> Created`, allocating what the task needs to run.
    fn create(&self);

    /// Run (or resume) the body.
    fn enter(&self);

    /// Settle a finished task.
    fn exit(&self) {
        self.core().complete();
    }

    /// Release resources of an aborted task.
    fn discard(&self) {}
}

/// A callback that runs to completion inside one dispatch step.
pub(crate) struct PlainTask {
    core: TaskCore,
    body: Mutex<Option<Body>>,
}

impl PlainTask {
    pub(crate) fn new(body: Body) -> Self {
        Self {
            core: TaskCore::new(TaskKind::Plain),
            body: Mutex::new(Some(body)),
        }
    }
}

impl Task for PlainTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn create(&self) {
        self.core.transition(Status::Inactive, Status::Created);
    }

    fn enter(&self) {
        if !self.core.transition(Status::Created, Status::Active) {
            return;
        }
        self.core.record_dispatch();
        let body = self.body.lock().take();
        let Some(body) = body else {
            return;
        };
        match run_body(body) {
            Ok(()) => {
                if self.core.finish() {
                    self.core.complete();
                }
            }
            Err(reason) => self.core.fail(reason),
        }
    }

    fn discard(&self) {
        drop(self.body.lock().take());
    }
}

/// Shared handle to a scheduled task.
///
/// Handles are reference counted: the task lives until the scheduler
/// and every clone of the handle have released it.
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<dyn Task>,
}

impl TaskHandle {
    pub(crate) fn new(task: Arc<dyn Task>) -> Self {
        Self { task }
    }

    pub(crate) fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    fn core(&self) -> &TaskCore {
        self.task.core()
    }

    /// Get the task's unique identifier.
    pub fn id(&self) -> TaskId {
        self.core().id
    }

    /// Plain task or coroutine.
    pub fn kind(&self) -> TaskKind {
        self.core().kind
    }

    /// Get the current status of the task.
    pub fn status(&self) -> Status {
        self.core().status()
    }

    /// Check if the task is finished or aborted.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Reason the task was aborted, if it was.
    pub fn error(&self) -> Option<TaskError> {
        self.core().error()
    }

    /// Number of times a dispatcher entered the task.
    pub fn dispatch_count(&self) -> usize {
        self.core().dispatches.load(Ordering::Relaxed)
    }

    /// Abort the task and fire its cancellation handlers.
    ///
    /// Safe to call from any thread. Returns false, and does nothing, if
    /// the task had already finished or been aborted. A running plain
    /// task still runs to the end of its callback; a suspended coroutine
    /// sees the abort as an error from its next `yield_now()`.
    pub fn abort(&self) -> bool {
        self.core().abort_with(TaskError::Cancelled)
    }

    pub(crate) fn abort_with(&self, reason: TaskError) -> bool {
        self.core().abort_with(reason)
    }

    /// Run `handler` once when the task finishes normally.
    ///
    /// If it has already finished, `handler` runs immediately on the
    /// calling thread. If it was aborted, `handler` is dropped.
    pub fn add_completion_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core().add_handler(Settlement::Completed, Box::new(handler));
    }

    /// Run `handler` once when the task is aborted.
    ///
    /// If it has already been aborted, `handler` runs immediately on the
    /// calling thread. If it finished, `handler` is dropped.
    pub fn add_cancellation_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core().add_handler(Settlement::Cancelled, Box::new(handler));
    }

    /// Wait from inside a coroutine until the task settles.
    ///
    /// Busy-polls the scheduler by yielding the calling coroutine, so no
    /// worker thread is blocked. Fails if called outside a coroutine, or
    /// if the calling coroutine is aborted while waiting.
    pub fn wait(&self) -> Result<Status, SchedulerError> {
        context::ensure_can_yield()?;
        let done = Arc::new(AtomicBool::new(false));
        let on_complete = Arc::clone(&done);
        self.add_completion_handler(move || on_complete.store(true, Ordering::Release));
        let on_cancel = Arc::clone(&done);
        self.add_cancellation_handler(move || on_cancel.store(true, Ordering::Release));

        while !done.load(Ordering::Acquire) {
            context::yield_now()?;
        }
        Ok(self.status())
    }

    /// Block the calling thread until the task settles and its handlers have run.
    ///
    /// Meant for threads outside the pool. Calling it from a dispatcher
    /// thread occupies that worker for the whole wait.
    pub fn wait_blocking(&self) -> Status {
        self.core().wait_settled(None);
        self.status()
    }

    /// Like [`wait_blocking`](Self::wait_blocking), giving up after `timeout`.
    ///
    /// Returns `None` if the task had not settled in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Status> {
        if self.core().wait_settled(Some(Instant::now() + timeout)) {
            Some(self.status())
        } else {
            None
        }
    }

    /// Create a handle that does not keep the task alive.
    pub fn downgrade(&self) -> WeakTaskHandle {
        WeakTaskHandle {
            id: self.id(),
            task: Arc::downgrade(&self.task),
        }
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}

/// Non-owning handle to a task.
#[derive(Clone)]
pub struct WeakTaskHandle {
    id: TaskId,
    task: Weak<dyn Task>,
}

impl WeakTaskHandle {
    /// Identifier of the task, valid even after it has been released.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current status, or [`Status::Unknown`] once the task is released.
    pub fn status(&self) -> Status {
        self.task
            .upgrade()
            .map(|task| task.core().status())
            .unwrap_or(Status::Unknown)
    }

    /// Get a strong handle if the task is still alive.
    pub fn upgrade(&self) -> Option<TaskHandle> {
        self.task.upgrade().map(TaskHandle::new)
    }
}

impl fmt::Debug for WeakTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTaskHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;

    fn plain<F, R>(f: F) -> TaskHandle
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        TaskHandle::new(Arc::new(PlainTask::new(boxed_body(f))))
    }

    fn step(handle: &TaskHandle) {
        let task = handle.task();
        task.create();
        task.enter();
        task.exit();
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        let make = move || -> Box<dyn FnOnce() + Send> {
            let shared = Arc::clone(&shared);
            Box::new(move || {
                shared.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    #[test]
    fn test_task_id_unique() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId(42);
        assert_eq!(format!("{}", id), "Task(42)");
    }

    #[test]
    fn test_plain_task_state_progression() {
        let handle = plain(|| {});
        assert_eq!(handle.status(), Status::Inactive);

        handle.task().create();
        assert_eq!(handle.status(), Status::Created);

        handle.task().enter();
        assert_eq!(handle.status(), Status::Finished);
        assert_eq!(handle.dispatch_count(), 1);
    }

    #[test]
    fn test_completion_handlers_run_once_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let handle = plain(|| {});
        for i in 0..3 {
            let order = Arc::clone(&order);
            handle.add_completion_handler(move || order.lock().push(i));
        }
        let (cancelled, make) = counter();
        handle.add_cancellation_handler(make());

        step(&handle);
        handle.task().exit();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let handle = plain(|| {});
        let (cancelled, make) = counter();
        handle.add_cancellation_handler(make());

        assert!(handle.abort());
        assert!(!handle.abort());

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(handle.status(), Status::Aborted);
        assert_eq!(handle.error(), Some(TaskError::Cancelled));
    }

    #[test]
    fn test_abort_before_enter_skips_body() {
        let (ran, make) = counter();
        let body = make();
        let handle = plain(move || body());
        handle.abort();
        step(&handle);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(handle.status(), Status::Aborted);
    }

    #[test]
    fn test_abort_after_finish_is_noop() {
        let handle = plain(|| {});
        let (cancelled, make) = counter();
        handle.add_cancellation_handler(make());
        step(&handle);

        assert!(!handle.abort());
        assert_eq!(handle.status(), Status::Finished);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_late_completion_handler_runs_immediately() {
        let handle = plain(|| {});
        step(&handle);

        let (completed, make) = counter();
        handle.add_completion_handler(make());
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        let (cancelled, make) = counter();
        handle.add_cancellation_handler(make());
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_late_cancellation_handler_runs_immediately() {
        let handle = plain(|| {});
        handle.abort();

        let (cancelled, make) = counter();
        handle.add_cancellation_handler(make());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        let (completed, make) = counter();
        handle.add_completion_handler(make());
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_body_aborts() {
        let handle = plain(|| Err::<(), _>("disk on fire"));
        let (cancelled, make) = counter();
        handle.add_cancellation_handler(make());
        step(&handle);

        assert_eq!(handle.status(), Status::Aborted);
        assert_eq!(
            handle.error(),
            Some(TaskError::Failed("disk on fire".to_string()))
        );
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_body_aborts() {
        let handle = plain::<_, ()>(|| panic!("intentional panic"));
        step(&handle);

        assert_eq!(handle.status(), Status::Aborted);
        assert_eq!(
            handle.error(),
            Some(TaskError::Panicked("intentional panic".to_string()))
        );
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let handle = plain(|| {});
        handle.add_completion_handler(|| panic!("bad handler"));
        let (completed, make) = counter();
        handle.add_completion_handler(make());
        step(&handle);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_outside_coroutine_fails() {
        let handle = plain(|| {});
        assert_eq!(handle.wait(), Err(SchedulerError::NotInTask));
    }

    #[test]
    fn test_wait_blocking_from_other_thread() {
        let handle = plain(|| thread::sleep(Duration::from_millis(20)));
        let stepper = handle.clone();
        let worker = thread::spawn(move || step(&stepper));

        assert_eq!(handle.wait_blocking(), Status::Finished);
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_blocking_returns_after_slow_handlers() {
        let handle = plain(|| {});
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        handle.add_completion_handler(move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
        });

        let stepper = handle.clone();
        let worker = thread::spawn(move || step(&stepper));

        assert_eq!(handle.wait_blocking(), Status::Finished);
        assert!(observed.load(Ordering::SeqCst));
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_covers_cancellation_handlers() {
        let handle = plain(|| {});
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        handle.add_cancellation_handler(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });

        let aborter = handle.clone();
        let worker = thread::spawn(move || aborter.abort());

        assert_eq!(
            handle.wait_timeout(Duration::from_secs(10)),
            Some(Status::Aborted)
        );
        assert!(observed.load(Ordering::SeqCst));
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let handle = plain(|| {});
        assert_eq!(handle.wait_timeout(Duration::from_millis(10)), None);
        handle.abort();
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(10)),
            Some(Status::Aborted)
        );
    }

    #[test]
    fn test_weak_handle_reports_unknown() {
        let handle = plain(|| {});
        let weak = handle.downgrade();
        assert_eq!(weak.status(), Status::Inactive);
        assert!(weak.upgrade().is_some());

        drop(handle);
        assert_eq!(weak.status(), Status::Unknown);
        assert!(weak.upgrade().is_none());
    }
}
