//! Task lifecycle states and their atomic cell.
//!
//! Legal transitions:
//!
//! ```text
//! Inactive -> Created -> Active -> (Pending -> Active)* -> Finished
//!                                                       \-> Aborted
//! ```
//!
//! `Aborted` can be entered from any non-terminal state, by any thread.
//! Every other transition is made by the thread currently executing the
//! task, and is a compare-and-swap so it never overwrites an abort.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of a schedulable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Not yet touched by a dispatcher.
    Inactive = 0,
    /// Resources allocated, body not yet entered.
    Created = 1,
    /// Body is running on some thread.
    Active = 2,
    /// Coroutine suspended itself and waits to be resumed.
    Pending = 3,
    /// Body returned normally.
    Finished = 4,
    /// Task was cancelled or its body failed.
    Aborted = 5,
    /// The task has already been released by every owner.
    Unknown = 6,
}

impl Status {
    /// Finished or aborted; no further dispatch occurs.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Aborted)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Status::Inactive,
            1 => Status::Created,
            2 => Status::Active,
            3 => Status::Pending,
            4 => Status::Finished,
            5 => Status::Aborted,
            _ => Status::Unknown,
        }
    }

    /// Lowercase name, as exposed to embedders.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Inactive => "inactive",
            Status::Created => "created",
            Status::Active => "active",
            Status::Pending => "pending",
            Status::Finished => "finished",
            Status::Aborted => "aborted",
            Status::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic cell holding a [`Status`].
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    #[inline]
    pub(crate) fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to`. Returns false if the current state is not `from`.
    pub(crate) fn transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move any non-terminal state to `Aborted`.
    ///
    /// Returns the state that was replaced, or `None` if the task was
    /// already terminal. Only one caller ever gets `Some`.
    pub(crate) fn abort(&self) -> Option<Status> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if Status::from_u8(current).is_terminal() {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                Status::Aborted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Status::from_u8(current)),
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for AtomicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicStatus").field(&self.load()).finish()
    }
}
