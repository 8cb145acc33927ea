//! Task state and suspension point types

use core::fmt;
use std::time::Instant;

/// State of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued for its next poll
    Ready = 0,

    /// Currently being polled
    Running = 1,

    /// Parked on a suspension point, waiting for a wake-up
    Suspended = 2,

    /// Body returned
    Finished = 3,

    /// Dropped after a cancellation request
    Cancelled = 4,
}

impl TaskState {
    /// Check if this state allows the task to be polled
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, TaskState::Ready)
    }

    /// Check if this task has terminated (finished or cancelled)
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Finished => "finished",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Readiness direction a task can wait for on a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Where a suspended task is parked
///
/// Recorded by the runtime's suspension futures so that a task dump can say
/// what every task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspendPoint {
    /// Not suspended (or never polled yet)
    #[default]
    None,

    /// Waiting for readiness on a descriptor
    Io { fd: i32, direction: Direction },

    /// Waiting for a sleep deadline
    Sleep { deadline: Instant },

    /// Waiting on something outside the reactor (channel, join handle)
    Await,
}

impl fmt::Display for SuspendPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendPoint::None => f.write_str("-"),
            SuspendPoint::Io { fd, direction } => write!(f, "{} fd={}", direction, fd),
            SuspendPoint::Sleep { deadline } => {
                let left = deadline.saturating_duration_since(Instant::now());
                write!(f, "sleep ({}ms left)", left.as_millis())
            }
            SuspendPoint::Await => f.write_str("await"),
        }
    }
}
