//! Per-scheduler event loop.
//!
//! Stands in for the external reactor the scheduler is embedded in: a
//! polled [`TimerWheel`] for deadlines plus a queue of posted handlers
//! through which I/O readiness notifications reach the dispatchers.
//! Dispatchers call [`EventLoop::poll_one`] between dispatch steps.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal};
use tracing::error;

use crate::error::panic_message;
use crate::task::Callback;
use crate::timer::{TimerHandle, TimerWheel};

pub(crate) struct EventLoop {
    timers: TimerWheel,
    ready: Injector<Callback>,
    /// Handlers posted but not yet run.
    posted: AtomicUsize,
}

impl EventLoop {
    pub(crate) fn new(tick_interval: Duration, wheel_size: usize) -> Self {
        Self {
            timers: TimerWheel::with_config(tick_interval, wheel_size),
            ready: Injector::new(),
            posted: AtomicUsize::new(0),
        }
    }

    /// Queue a handler to run on the next dispatcher that polls.
    pub(crate) fn post(&self, handler: Callback) {
        self.posted.fetch_add(1, Ordering::SeqCst);
        self.ready.push(handler);
    }

    /// Arm a timer whose callback is posted once it expires.
    pub(crate) fn schedule_timer<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.timers.schedule(delay, callback)
    }

    /// Collect expired timers, then run at most one ready handler.
    ///
    /// Returns true if a handler ran.
    pub(crate) fn poll_one(&self) -> bool {
        for callback in self.timers.advance_to(Instant::now()) {
            self.post(callback);
        }

        let handler = loop {
            match self.ready.steal() {
                Steal::Success(handler) => break handler,
                Steal::Empty => return false,
                Steal::Retry => continue,
            }
        };
        self.posted.fetch_sub(1, Ordering::SeqCst);

        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(handler)) {
            error!("event loop handler panicked: {}", panic_message(panic.as_ref()));
        }
        true
    }

    pub(crate) fn posted(&self) -> usize {
        self.posted.load(Ordering::SeqCst)
    }

    pub(crate) fn armed_timers(&self) -> usize {
        self.timers.armed()
    }

    /// Whether any handler or timer is still outstanding.
    pub(crate) fn has_pending(&self) -> bool {
        self.posted() > 0 || self.armed_timers() > 0
    }
}
