//! Timer wheel for delayed work.
//!
//! A single-level timing wheel polled by the scheduler's dispatchers
//! rather than driven by a thread of its own. Key properties:
//!
//! - Constant-time arming and cancellation
//! - Expiry work proportional to the ticks actually crossed
//! - A timer never fires before its delay has elapsed
//!
//! # Design
//!
//! Deadlines are computed from wall time relative to the wheel's start,
//! so a wheel that has not been polled for a while catches up in one
//! call to [`TimerWheel::advance_to`] instead of firing timers early.
//! One mutex guards the slots and the tick cursor; a dispatcher that
//! finds it taken simply skips this round.
//!
//! Firing and cancelling race through a single atomic per timer, so
//! exactly one of them wins: a cancelled timer never fires, and a timer
//! that already fired cannot be cancelled.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::task::Callback;

/// Wheel resolution used unless configured otherwise.
pub(crate) const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Slot count: one revolution spans about a second at the default resolution.
pub(crate) const DEFAULT_WHEEL_SIZE: usize = 1024;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// One armed callback, filed under the slot of its deadline tick.
struct TimerEntry {
    /// Absolute tick at which the callback becomes due
    deadline_ticks: u64,
    callback: Callback,
    /// Shared with the handle
    state: Arc<AtomicU8>,
}

/// Cancellation handle for an armed timer.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    state: Arc<AtomicU8>,
    armed: Arc<AtomicUsize>,
}

impl TimerHandle {
    /// Cancel this timer.
    ///
    /// Returns true if the timer was cancelled, false if it already fired
    /// or was cancelled before.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.armed.fetch_sub(1, Ordering::AcqRel);
        }
        cancelled
    }

    /// Whether [`cancel`](Self::cancel) won the race against expiry.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Check if this timer has fired.
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// Get the timer ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("fired", &self.has_fired())
            .finish()
    }
}

struct WheelState {
    /// Entries bucketed by `deadline_ticks % wheel_size`
    slots: Vec<VecDeque<TimerEntry>>,
    /// Next tick to process
    current_tick: u64,
}

/// A polled timing wheel.
pub struct TimerWheel {
    state: Mutex<WheelState>,
    /// Next timer ID
    next_id: AtomicU64,
    /// Timers neither fired nor cancelled
    armed: Arc<AtomicUsize>,
    tick_interval: Duration,
    wheel_size: usize,
    start_time: Instant,
}

impl TimerWheel {
    /// A wheel with the default resolution and slot count.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_TICK_INTERVAL, DEFAULT_WHEEL_SIZE)
    }

    /// A wheel with the given resolution and slot count.
    ///
    /// A zero tick interval is raised to one microsecond and a zero wheel
    /// size to a single slot.
    pub fn with_config(tick_interval: Duration, wheel_size: usize) -> Self {
        let tick_interval = tick_interval.max(Duration::from_micros(1));
        let wheel_size = wheel_size.max(1);
        let slots = (0..wheel_size).map(|_| VecDeque::new()).collect();

        Self {
            state: Mutex::new(WheelState {
                slots,
                current_tick: 0,
            }),
            next_id: AtomicU64::new(1),
            armed: Arc::new(AtomicUsize::new(0)),
            tick_interval,
            wheel_size,
            start_time: Instant::now(),
        }
    }

    fn ticks_for(&self, elapsed: Duration, round_up: bool) -> u64 {
        let tick = self.tick_interval.as_nanos();
        let nanos = elapsed.as_nanos();
        let ticks = if round_up {
            (nanos + tick - 1) / tick
        } else {
            nanos / tick
        };
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Arm `callback` to become due once `delay` has elapsed.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(AtomicU8::new(ARMED));
        let due = self.start_time.elapsed().saturating_add(delay);
        let deadline = self.ticks_for(due, true);

        {
            let mut wheel = self.state.lock();
            let deadline_ticks = deadline.max(wheel.current_tick);
            let slot_index = (deadline_ticks % self.wheel_size as u64) as usize;
            wheel.slots[slot_index].push_back(TimerEntry {
                deadline_ticks,
                callback: Box::new(callback),
                state: Arc::clone(&state),
            });
            self.armed.fetch_add(1, Ordering::AcqRel);
        }

        TimerHandle {
            id,
            state,
            armed: Arc::clone(&self.armed),
        }
    }

    /// Arm `callback` for an absolute deadline.
    pub fn schedule_at<F>(&self, deadline: Instant, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = deadline.saturating_duration_since(Instant::now());
        self.schedule(delay, callback)
    }

    fn tick_locked(&self, wheel: &mut WheelState, expired: &mut Vec<Callback>) {
        let current = wheel.current_tick;
        let slot_index = (current % self.wheel_size as u64) as usize;
        let slot = std::mem::take(&mut wheel.slots[slot_index]);

        let mut remaining = VecDeque::new();
        for entry in slot {
            if entry.state.load(Ordering::Acquire) != ARMED {
                continue;
            }
            if entry.deadline_ticks > current {
                // Due on a later revolution.
                remaining.push_back(entry);
                continue;
            }
            let fired = entry
                .state
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if fired {
                self.armed.fetch_sub(1, Ordering::AcqRel);
                expired.push(entry.callback);
            }
        }

        wheel.slots[slot_index] = remaining;
        wheel.current_tick = current + 1;
    }

    /// Process exactly one tick, ignoring the clock, and return what became due.
    pub fn advance(&self) -> Vec<Callback> {
        let mut expired = Vec::new();
        let mut wheel = self.state.lock();
        self.tick_locked(&mut wheel, &mut expired);
        expired
    }

    /// Process every tick up to `now` and return the expired callbacks.
    ///
    /// Returns nothing if another thread is advancing the wheel.
    pub fn advance_to(&self, now: Instant) -> Vec<Callback> {
        let target = self.ticks_for(now.saturating_duration_since(self.start_time), false);
        let mut expired = Vec::new();
        let Some(mut wheel) = self.state.try_lock() else {
            return expired;
        };
        if self.armed.load(Ordering::Acquire) == 0 && wheel.current_tick <= target {
            // Nothing to fire: jump straight to the present.
            wheel.current_tick = target + 1;
            return expired;
        }
        while wheel.current_tick <= target {
            self.tick_locked(&mut wheel, &mut expired);
        }
        expired
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn armed(&self) -> usize {
        self.armed.load(Ordering::Acquire)
    }

    /// Next tick to be processed.
    pub fn current_tick(&self) -> u64 {
        self.state.lock().current_tick
    }

    /// Duration of one tick.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("tick_interval", &self.tick_interval)
            .field("wheel_size", &self.wheel_size)
            .field("armed", &self.armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// A callback factory and the counter its callbacks bump.
    fn hits() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        (count, move || -> Box<dyn FnOnce() + Send> {
            let shared = Arc::clone(&shared);
            Box::new(move || {
                shared.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn tick(wheel: &TimerWheel, ticks: usize) {
        for _ in 0..ticks {
            wheel.advance().into_iter().for_each(|callback| callback());
        }
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let wheel = TimerWheel::new();
        let (count, callback) = hits();
        let timer = wheel.schedule(Duration::from_millis(10), callback());

        assert!(!timer.is_cancelled());
        assert!(timer.cancel());
        assert!(timer.is_cancelled());
        assert!(!timer.cancel());
        assert_eq!(wheel.armed(), 0);

        tick(&wheel, 40);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fired_timer_cannot_be_cancelled() {
        let wheel = TimerWheel::with_config(Duration::from_millis(1), 64);
        let (count, callback) = hits();
        let timer = wheel.schedule(Duration::from_millis(5), callback());

        tick(&wheel, 40);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(timer.has_fired());
        assert!(!timer.cancel());
    }

    #[test]
    fn test_armed_count_tracks_expiry() {
        let wheel = TimerWheel::with_config(Duration::from_millis(1), 64);
        let (count, callback) = hits();
        for delay in (0..20).step_by(2) {
            wheel.schedule(Duration::from_millis(delay), callback());
        }
        assert_eq!(wheel.armed(), 10);

        tick(&wheel, 60);
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(wheel.armed(), 0);
    }

    #[test]
    fn test_deadline_beyond_one_revolution() {
        let wheel = TimerWheel::with_config(Duration::from_millis(1), 8);
        let (count, callback) = hits();
        wheel.schedule(Duration::from_millis(20), callback());

        tick(&wheel, 8);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tick(&wheel, 60);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_advance_to_waits_for_wall_clock() {
        let wheel = TimerWheel::new();
        let (count, callback) = hits();
        let armed_at = Instant::now();
        wheel.schedule(Duration::from_millis(30), callback());

        let early = wheel.advance_to(Instant::now());
        if armed_at.elapsed() < Duration::from_millis(30) {
            assert!(early.is_empty());
        }

        thread::sleep(Duration::from_millis(40));
        let due = wheel.advance_to(Instant::now());
        assert_eq!(due.len(), 1);
        due.into_iter().for_each(|callback| callback());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_absolute_deadline() {
        let wheel = TimerWheel::new();
        let (count, callback) = hits();
        wheel.schedule_at(Instant::now() + Duration::from_millis(5), callback());

        tick(&wheel, 40);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_wheel_jumps_forward() {
        let wheel = TimerWheel::new();
        thread::sleep(Duration::from_millis(5));
        assert!(wheel.advance_to(Instant::now()).is_empty());
        assert!(wheel.current_tick() >= 5);
    }
}
