//! Weft Runtime - a task scheduler for callbacks and stackful coroutines
//!
//! This crate multiplexes units of work over a bounded pool of worker
//! threads:
//! - `Scheduler` - owns the ready queue, the worker pool and the event loop
//! - `TaskHandle` - shared handle to a plain task or a coroutine
//! - `TaskGroup` - join point over a set of tasks
//! - `yield_now` - suspend the running coroutine
//! - `TimerWheel` - hashed timing wheel driving delayed work
//!
//! # Design Goals
//!
//! - Plain tasks run to completion on whichever worker pops them
//! - Coroutines suspend cooperatively and resume on any worker, keeping
//!   their stack across suspensions
//! - Workers are spawned on demand up to a ceiling and exit when idle
//! - Status transitions are atomic; completion and cancellation handlers
//!   fire exactly once
//!
//! # Coroutines
//!
//! A coroutine runs on its own stack, switched onto in place by the
//! dispatcher that resumes it. A suspended coroutine is just memory, so
//! no thread exists beyond the pool and the thread-start hooks apply to
//! coroutine bodies as they do to plain tasks.

mod context;
mod coroutine;
pub mod error;
mod event_loop;
pub mod group;
mod queue;
pub mod scheduler;
pub mod status;
pub mod task;
pub mod timer;

use std::thread;
use std::time::Duration;

pub use context::{can_yield, current_task, yield_now};
pub use error::{SchedulerError, TaskError};
pub use group::TaskGroup;
pub use scheduler::{Holder, Scheduler, TimeoutId};
pub use status::Status;
pub use task::{TaskHandle, TaskId, TaskKind, TaskOutput, WeakTaskHandle};
pub use timer::{TimerHandle, TimerWheel};

/// Default stack size for coroutine stacks (bytes).
pub const DEFAULT_COROUTINE_STACK_SIZE: usize = 256 * 1024;

/// Configuration for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Ceiling on worker threads
    pub max_threads: usize,
    /// Name prefix for worker threads
    pub thread_name_prefix: String,
    /// Stack size for coroutine stacks (bytes)
    pub coroutine_stack_size: usize,
    /// How long an idle dispatcher sleeps before polling again
    pub idle_delay: Duration,
    /// Timer wheel resolution
    pub timer_tick: Duration,
    /// Number of timer wheel slots
    pub timer_slots: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_name_prefix: "weft-worker".to_string(),
            coroutine_stack_size: DEFAULT_COROUTINE_STACK_SIZE,
            idle_delay: Duration::from_micros(200),
            timer_tick: timer::DEFAULT_TICK_INTERVAL,
            timer_slots: timer::DEFAULT_WHEEL_SIZE,
        }
    }
}

impl SchedulerConfig {
    /// Create a new scheduler configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread ceiling.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for coroutine stacks.
    pub fn with_coroutine_stack_size(mut self, size: usize) -> Self {
        self.coroutine_stack_size = size;
        self
    }

    /// Set how long idle dispatchers sleep between polls.
    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Set the timer wheel resolution and slot count.
    pub fn with_timer_wheel(mut self, tick: Duration, slots: usize) -> Self {
        self.timer_tick = tick;
        self.timer_slots = slots;
        self
    }

    /// A scheduler needs at least one worker to make progress.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_threads = self.max_threads.max(1);
        self
    }
}
