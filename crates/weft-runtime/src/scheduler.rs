//! The scheduler: a bounded pool of dispatcher threads over one ready queue.
//!
//! # Design
//!
//! - Lock-free MPMC ready queue shared by every dispatcher
//! - Worker threads are grown lazily, up to `max_threads`, as work is
//!   queued, and exit on their own once there is nothing left to do
//! - Each dispatch step advances one task by one state transition:
//!   create, enter (run or resume), then requeue or settle
//! - Delayed and dependent tasks reserve their queued count up front so
//!   `remaining()` stays accurate while they wait
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use weft_runtime::{Scheduler, Status};
//!
//! let scheduler = Scheduler::new(4);
//! let counter = Arc::new(AtomicUsize::new(0));
//! let handles: Vec<_> = (0..10)
//!     .map(|_| {
//!         let counter = Arc::clone(&counter);
//!         scheduler.schedule_task(move || {
//!             counter.fetch_add(1, Ordering::SeqCst);
//!         })
//!     })
//!     .collect();
//!
//! scheduler.start().unwrap();
//! scheduler.join_pool().unwrap();
//! scheduler.stop();
//! scheduler.join().unwrap();
//!
//! assert_eq!(counter.load(Ordering::SeqCst), 10);
//! assert!(handles.iter().all(|h| h.status() == Status::Finished));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::context::{self, Current, CurrentGuard, DispatcherGuard};
use crate::coroutine::CoroutineTask;
use crate::error::{panic_message, SchedulerError, TaskError};
use crate::event_loop::EventLoop;
use crate::queue::TaskQueue;
use crate::status::Status;
use crate::task::{boxed_body, PlainTask, Task, TaskHandle, TaskId, TaskOutput};
use crate::timer::TimerHandle;
use crate::SchedulerConfig;

type ThreadInit = Arc<dyn Fn() + Send + Sync + 'static>;

/// Identifier returned by [`Scheduler::set_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutId(u64);

impl TimeoutId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timeout({})", self.0)
    }
}

/// Shared state for the scheduler.
struct SchedulerInner {
    id: u64,
    config: SchedulerConfig,
    /// Tasks ready to be dispatched.
    queue: TaskQueue,
    /// Timers and posted handlers.
    events: EventLoop,
    /// Live worker threads, including slots reserved for threads being spawned.
    thread_count: CachePadded<AtomicUsize>,
    /// Tasks queued or reserved for queueing.
    queued: CachePadded<AtomicUsize>,
    /// Tasks inside a dispatch step.
    active: CachePadded<AtomicUsize>,
    hold_count: AtomicUsize,
    paused: AtomicBool,
    running: AtomicBool,
    /// Set when the scheduler is dropped: dispatchers leave after their current step.
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_worker: AtomicUsize,
    thread_init: Mutex<Vec<ThreadInit>>,
    /// Delayed and dependent tasks not yet in the ready queue.
    deferred: Mutex<HashMap<TaskId, TaskHandle>>,
    timeouts: Mutex<HashMap<TimeoutId, TaskHandle>>,
    next_timeout: AtomicU64,
}

impl SchedulerInner {
    fn remaining(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.active.load(Ordering::SeqCst)
    }

    fn has_work(&self) -> bool {
        self.remaining() > 0 || self.events.has_pending()
    }

    /// How many dispatchers the current backlog could keep busy.
    fn demand(&self) -> usize {
        let timers = usize::from(self.events.armed_timers() > 0);
        self.queued.load(Ordering::SeqCst) + self.events.posted() + timers
    }

    fn try_reserve_thread(&self) -> bool {
        let max = self.config.max_threads;
        let mut count = self.thread_count.load(Ordering::SeqCst);
        loop {
            if count >= max {
                return false;
            }
            match self.thread_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    /// Add workers while there is more backlog than workers, up to the ceiling.
    fn balance_threads(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        while self.thread_count.load(Ordering::SeqCst) < self.demand() {
            if !self.try_reserve_thread() {
                break;
            }
            if let Err(err) = self.add_thread() {
                self.thread_count.fetch_sub(1, Ordering::SeqCst);
                warn!(scheduler = self.id, "{}", err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Balance after posting an event. A spawn failure is already logged and
    /// the event waits for the next dispatcher.
    fn rebalance(self: &Arc<Self>) {
        if self.balance_threads().is_err() {
            debug!(
                scheduler = self.id,
                workers = self.thread_count.load(Ordering::SeqCst),
                "event left for the next dispatcher"
            );
        }
    }

    /// Balance after queuing or reserving `handle`.
    fn rebalance_for(self: &Arc<Self>, handle: &TaskHandle) {
        let result = self.balance_threads();
        self.abort_unserved(result, handle);
    }

    /// Abort `handle` when no worker could be started and none is alive to run it.
    fn abort_unserved(&self, result: Result<(), SchedulerError>, handle: &TaskHandle) {
        let Err(err) = result else {
            return;
        };
        if self.thread_count.load(Ordering::SeqCst) == 0
            && handle.abort_with(TaskError::SpawnFailed(err.to_string()))
        {
            warn!(scheduler = self.id, task = %handle.id(), "no worker available, task aborted");
        }
    }

    /// Spawn a worker into a slot already reserved in `thread_count`.
    fn add_thread(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.config.thread_name_prefix, index);
        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || inner.worker_main())
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
        Ok(())
    }

    fn worker_main(self: Arc<Self>) {
        let _dispatcher = DispatcherGuard::enter(self.id);
        self.run_thread_init();
        debug!(scheduler = self.id, "worker started");

        loop {
            self.dispatcher();
            self.thread_count.fetch_sub(1, Ordering::SeqCst);
            // Work queued while this worker was leaving may have seen it
            // as still alive; take the slot back rather than strand it.
            if self.shutdown.load(Ordering::SeqCst)
                || !self.has_work()
                || !self.try_reserve_thread()
            {
                break;
            }
        }

        debug!(scheduler = self.id, "worker exited");
    }

    fn run_thread_init(&self) {
        let hooks: Vec<ThreadInit> = self.thread_init.lock().clone();
        for hook in hooks {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| hook())) {
                warn!(
                    scheduler = self.id,
                    "thread start hook panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    /// Dispatch and poll events until there is nothing left to do.
    fn dispatcher(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let polled = self.events.poll_one();
            let drained = self.drain_tasks();
            if polled || drained > 0 {
                thread::yield_now();
                continue;
            }
            if !self.has_work() {
                break;
            }
            thread::sleep(self.config.idle_delay);
        }
    }

    /// Run one round of dispatch steps.
    ///
    /// The round is bounded by the queue length at its start so that a
    /// coroutine yielding in a loop cannot starve the event loop.
    fn drain_tasks(&self) -> usize {
        if self.paused.load(Ordering::SeqCst) || self.queue.is_empty() {
            return 0;
        }
        let budget = self.queue.len().max(1);
        let mut processed = 0;
        while processed < budget {
            let Some(task) = self.queue.pop() else {
                break;
            };
            self.active.fetch_add(1, Ordering::SeqCst);
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.dispatch(&task);
            self.active.fetch_sub(1, Ordering::SeqCst);
            processed += 1;
            if self.paused.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                break;
            }
        }
        processed
    }

    /// Advance one task by one step.
    fn dispatch(&self, handle: &TaskHandle) {
        let _current = CurrentGuard::enter(Current {
            scheduler: self.id,
            task: handle.id(),
            yielder: None,
        });
        let task = handle.task();

        let mut status = handle.status();
        trace!(task = %handle.id(), %status, "dispatch");
        if status == Status::Aborted {
            task.discard();
            return;
        }
        if status == Status::Inactive {
            task.create();
            status = handle.status();
        }
        if matches!(status, Status::Created | Status::Pending) {
            task.enter();
        }

        match handle.status() {
            Status::Pending => {
                self.queued.fetch_add(1, Ordering::SeqCst);
                self.queue.push(handle.clone());
            }
            Status::Aborted => task.discard(),
            _ => task.exit(),
        }
    }

    fn push(self: &Arc<Self>, handle: TaskHandle, count: bool) {
        if count {
            self.queued.fetch_add(1, Ordering::SeqCst);
        }
        self.queue.push(handle.clone());
        self.rebalance_for(&handle);
    }

    /// Count a task as queued before it reaches the ready queue.
    ///
    /// The returned flag is claimed exactly once: either by the path
    /// that enqueues the task or by its cancellation, which gives the
    /// reservation back.
    fn reserve(self: &Arc<Self>, handle: &TaskHandle) -> Arc<AtomicBool> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.deferred.lock().insert(handle.id(), handle.clone());

        let claimed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&claimed);
        let weak = Arc::downgrade(self);
        let id = handle.id();
        handle.add_cancellation_handler(move || {
            if flag.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.deferred.lock().remove(&id);
                inner.queued.fetch_sub(1, Ordering::SeqCst);
            }
        });
        claimed
    }

    /// Move a reserved task onto the ready queue, unless it was cancelled.
    fn release_reserved(self: &Arc<Self>, handle: TaskHandle, claimed: &AtomicBool) {
        if claimed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.deferred.lock().remove(&handle.id());
        self.push(handle, false);
    }

    fn forget_timeout(&self, id: TimeoutId) {
        self.timeouts.lock().remove(&id);
    }
}

/// Task scheduler multiplexing plain tasks and coroutines over a worker pool.
///
/// Dropping the scheduler stops it, joins its workers and aborts every
/// task that has not run yet.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler with at most `max_threads` worker threads.
    pub fn new(max_threads: usize) -> Self {
        Self::with_config(SchedulerConfig::new().with_max_threads(max_threads))
    }

    /// Create a scheduler from a full configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let config = config.normalized();
        let events = EventLoop::new(config.timer_tick, config.timer_slots);
        Self {
            inner: Arc::new(SchedulerInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                config,
                queue: TaskQueue::new(),
                events,
                thread_count: CachePadded::new(AtomicUsize::new(0)),
                queued: CachePadded::new(AtomicUsize::new(0)),
                active: CachePadded::new(AtomicUsize::new(0)),
                hold_count: AtomicUsize::new(0),
                paused: AtomicBool::new(false),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                next_worker: AtomicUsize::new(0),
                thread_init: Mutex::new(Vec::new()),
                deferred: Mutex::new(HashMap::new()),
                timeouts: Mutex::new(HashMap::new()),
                next_timeout: AtomicU64::new(1),
            }),
        }
    }

    /// The configuration this scheduler runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Start dispatching, spawning workers for any work already queued.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        info!(
            scheduler = self.inner.id,
            max_threads = self.inner.config.max_threads,
            "scheduler started"
        );
        self.inner.balance_threads()
    }

    /// Stop spawning workers. Existing workers drain the remaining work and exit.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!(
                scheduler = self.inner.id,
                remaining = self.remaining(),
                "scheduler stopping"
            );
        }
    }

    /// Stop popping new tasks. Running tasks and threads are unaffected.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Undo [`pause`](Self::pause).
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Block until every worker thread has exited.
    ///
    /// Must not be called from one of this scheduler's own threads.
    pub fn join(&self) -> Result<(), SchedulerError> {
        if context::is_dispatching_for(self.inner.id) {
            return Err(SchedulerError::JoinFromWorker);
        }
        loop {
            let workers = std::mem::take(&mut *self.inner.workers.lock());
            if workers.is_empty() {
                return Ok(());
            }
            for worker in workers {
                let _ = worker.join();
            }
        }
    }

    /// Dispatch on the calling thread until no work remains and nothing holds the loop.
    pub fn join_pool(&self) -> Result<(), SchedulerError> {
        self.join_pool_with(|| {})
    }

    /// Like [`join_pool`](Self::join_pool), calling `drain` after each pass.
    ///
    /// The calling thread dispatches as a guest: it is not counted by
    /// [`concurrency`](Self::concurrency). Thread start hooks run on entry,
    /// so coroutines resumed here see the same thread state as on a worker.
    pub fn join_pool_with<F>(&self, mut drain: F) -> Result<(), SchedulerError>
    where
        F: FnMut(),
    {
        if context::is_dispatching_for(self.inner.id) {
            return Err(SchedulerError::JoinFromWorker);
        }
        let _dispatcher = DispatcherGuard::enter(self.inner.id);
        self.inner.run_thread_init();
        loop {
            self.inner.dispatcher();
            drain();
            if self.inner.hold_count.load(Ordering::SeqCst) == 0
                || self.inner.shutdown.load(Ordering::SeqCst)
            {
                return Ok(());
            }
            thread::sleep(self.inner.config.idle_delay);
        }
    }

    /// Keep [`join_pool`](Self::join_pool) looping independently of queued work.
    pub fn hold(&self) {
        self.inner.hold_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one hold taken with [`hold`](Self::hold).
    pub fn release(&self) {
        let _ = self
            .inner
            .hold_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Take a hold that is released when the returned guard is dropped.
    pub fn holder(&self) -> Holder {
        self.hold();
        Holder {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Number of outstanding holds.
    pub fn holds(&self) -> usize {
        self.inner.hold_count.load(Ordering::SeqCst)
    }

    /// Number of live worker threads.
    pub fn concurrency(&self) -> usize {
        self.inner.thread_count.load(Ordering::SeqCst)
    }

    /// Configured worker ceiling.
    pub fn max_threads(&self) -> usize {
        self.inner.config.max_threads
    }

    /// Tasks waiting in (or reserved for) the ready queue.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Tasks currently inside a dispatch step.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// `queued() + active()`.
    pub fn remaining(&self) -> usize {
        self.inner.remaining()
    }

    /// Whether [`start`](Self::start) was called without a matching [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether dispatch of queued tasks is paused; events still run.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Register a callback run once at the start of every new worker thread,
    /// and on each entry into [`join_pool`](Self::join_pool).
    pub fn on_thread_start<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.thread_init.lock().push(Arc::new(hook));
    }

    fn plain<F, R>(&self, f: F) -> Arc<dyn Task>
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        Arc::new(PlainTask::new(boxed_body(f)))
    }

    fn coroutine<F, R>(&self, f: F) -> Arc<dyn Task>
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        Arc::new(CoroutineTask::new(
            boxed_body(f),
            self.inner.id,
            self.inner.config.coroutine_stack_size,
        ))
    }

    fn enqueue(&self, task: Arc<dyn Task>) -> TaskHandle {
        let handle = TaskHandle::new(task);
        self.inner.push(handle.clone(), true);
        handle
    }

    fn enqueue_after(&self, delay: Duration, task: Arc<dyn Task>) -> TaskHandle {
        let handle = TaskHandle::new(task);
        let claimed = self.inner.reserve(&handle);

        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let ready = handle.clone();
        let timer = self.inner.events.schedule_timer(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.release_reserved(ready, &claimed);
            }
        });
        handle.add_cancellation_handler(move || {
            timer.cancel();
        });

        self.inner.rebalance_for(&handle);
        handle
    }

    fn enqueue_then(&self, parent: &TaskHandle, task: Arc<dyn Task>) -> TaskHandle {
        let handle = TaskHandle::new(task);
        let claimed = self.inner.reserve(&handle);

        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let ready = handle.clone();
        parent.add_completion_handler(move || {
            if let Some(inner) = weak.upgrade() {
                inner.release_reserved(ready, &claimed);
            }
        });
        let dependent = handle.clone();
        parent.add_cancellation_handler(move || {
            dependent.abort();
        });

        self.inner.rebalance_for(&handle);
        handle
    }

    /// Queue a plain task.
    pub fn schedule_task<F, R>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        self.enqueue(self.plain(f))
    }

    /// Queue a plain task once `delay` has elapsed.
    ///
    /// Aborting the task before then cancels its timer.
    pub fn schedule_task_after<F, R>(&self, delay: Duration, f: F) -> TaskHandle
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        self.enqueue_after(delay, self.plain(f))
    }

    /// Queue a coroutine.
    pub fn schedule_coroutine<F, R>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        self.enqueue(self.coroutine(f))
    }

    /// Queue a coroutine once `delay` has elapsed.
    pub fn schedule_coroutine_after<F, R>(&self, delay: Duration, f: F) -> TaskHandle
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        self.enqueue_after(delay, self.coroutine(f))
    }

    /// Queue a plain task when `parent` finishes; abort it if `parent` is aborted.
    pub fn schedule_task_then<F, R>(&self, parent: &TaskHandle, f: F) -> TaskHandle
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        self.enqueue_then(parent, self.plain(f))
    }

    /// Queue a coroutine when `parent` finishes; abort it if `parent` is aborted.
    pub fn schedule_coroutine_then<F, R>(&self, parent: &TaskHandle, f: F) -> TaskHandle
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        self.enqueue_then(parent, self.coroutine(f))
    }

    /// Suspend the calling coroutine.
    ///
    /// Like [`crate::yield_now`], but also fails with
    /// [`SchedulerError::ForeignScheduler`] when the caller belongs to
    /// another scheduler.
    pub fn yield_now(&self) -> Result<(), SchedulerError> {
        let current = context::current().ok_or(SchedulerError::NotInTask)?;
        if current.scheduler != self.inner.id {
            return Err(SchedulerError::ForeignScheduler);
        }
        let yielder = current.yielder.ok_or(SchedulerError::NotCoroutine)?;
        yielder.suspend()
    }

    /// Whether the calling thread is a coroutine of this scheduler.
    pub fn can_yield(&self) -> bool {
        context::current()
            .map(|current| current.scheduler == self.inner.id && current.yielder.is_some())
            .unwrap_or(false)
    }

    /// Post a handler to run on a dispatcher thread, outside of any task.
    ///
    /// This is how readiness notifications from an external reactor
    /// reach the pool.
    pub fn post<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.events.post(Box::new(handler));
        self.inner.rebalance();
    }

    /// Arm a raw timer whose callback runs on a dispatcher thread.
    pub fn schedule_timer<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let timer = self.inner.events.schedule_timer(delay, callback);
        self.inner.rebalance();
        timer
    }

    /// Run `f` as a plain task after `delay`, tracked under a timeout id.
    pub fn set_timeout<F, R>(&self, delay: Duration, f: F) -> TimeoutId
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        let id = TimeoutId(self.inner.next_timeout.fetch_add(1, Ordering::Relaxed));
        let handle = TaskHandle::new(self.plain(f));
        self.inner.timeouts.lock().insert(id, handle.clone());

        let forget = move |weak: Weak<SchedulerInner>| {
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.forget_timeout(id);
                }
            }
        };
        handle.add_completion_handler(forget(Arc::downgrade(&self.inner)));
        handle.add_cancellation_handler(forget(Arc::downgrade(&self.inner)));

        self.enqueue_after(delay, Arc::clone(handle.task()));
        id
    }

    /// Cancel a timeout. Returns false if it already ran or was cleared.
    pub fn clear_timeout(&self, id: TimeoutId) -> bool {
        let handle = self.inner.timeouts.lock().remove(&id);
        handle.map(|handle| handle.abort()).unwrap_or(false)
    }

    /// Number of timeouts that have neither run nor been cleared.
    pub fn pending_timeouts(&self) -> usize {
        self.inner.timeouts.lock().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_config(SchedulerConfig::default())
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.inner.id)
            .field("max_threads", &self.inner.config.max_threads)
            .field("concurrency", &self.concurrency())
            .field("queued", &self.queued())
            .field("active", &self.active())
            .field("running", &self.is_running())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if !context::is_dispatching_for(self.inner.id) {
            let _ = self.join();
        }

        let mut aborted = 0;
        while let Some(handle) = self.inner.queue.pop() {
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            handle.abort();
            handle.task().discard();
            aborted += 1;
        }
        let deferred: Vec<TaskHandle> = self.inner.deferred.lock().drain().map(|(_, h)| h).collect();
        for handle in deferred {
            handle.abort();
            handle.task().discard();
            aborted += 1;
        }
        if aborted > 0 {
            debug!(scheduler = self.inner.id, aborted, "aborted unfinished tasks on drop");
        }
    }
}

/// Keeps a scheduler's [`join_pool`](Scheduler::join_pool) loop alive while held.
///
/// Cloning takes another hold; dropping releases one.
pub struct Holder {
    inner: Option<Arc<SchedulerInner>>,
}

impl Holder {
    /// Release the hold early.
    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = inner
                .hold_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    /// Whether this guard still holds its scheduler.
    pub fn is_held(&self) -> bool {
        self.inner.is_some()
    }
}

impl Clone for Holder {
    fn clone(&self) -> Self {
        if let Some(inner) = &self.inner {
            inner.hold_count.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Holder {
    fn drop(&mut self) {
        self.reset();
    }
}

impl fmt::Debug for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Holder").field("held", &self.is_held()).finish()
    }
}
