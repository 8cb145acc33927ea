//! Error types for the baton runtime

use core::fmt;

use thiserror::Error;

use crate::id::TaskId;
use crate::state::Direction;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler operations
#[derive(Debug, Error)]
pub enum SchedError {
    /// The task was cancelled while suspended
    #[error("task cancelled: {0}")]
    Cancelled(String),

    /// A second task tried to wait on a descriptor/direction that already has a waiter
    #[error("fd {fd} already has a {direction} waiter ({holder})")]
    AlreadyWaiting {
        fd: i32,
        direction: Direction,
        holder: TaskId,
    },

    /// Suspension point used outside of a runtime task
    #[error("not running inside a runtime task")]
    NoCurrentTask,

    /// `block_on` called while a task is being polled
    #[error("block_on called from inside a runtime task")]
    NestedBlockOn,

    /// Nothing runnable, nothing registered, no timers: the root future can never finish
    #[error("scheduler stalled: no runnable tasks, descriptors or timers")]
    Stalled,

    /// Signal bridge installed twice in one process
    #[error("signal bridge already installed")]
    SignalBridgeInstalled,

    /// Invalid runtime configuration
    #[error("invalid config: {0}")]
    Config(&'static str),

    /// Underlying OS error (I/O, poll, sigaction)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedError {
    /// Errors caused by misuse of the runtime API rather than by the environment.
    ///
    /// These are fatal to the offending task and never retried.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            SchedError::AlreadyWaiting { .. }
                | SchedError::NoCurrentTask
                | SchedError::NestedBlockOn
                | SchedError::SignalBridgeInstalled
                | SchedError::Config(_)
        )
    }

    /// Check whether this is an injected cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchedError::Cancelled(_))
    }

    /// The OS error kind, if this wraps an I/O error
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            SchedError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Error returned by `send` on a closed channel; gives the value back
#[derive(Clone, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send on closed channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Error returned by `try_send`
#[derive(Clone, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// Bounded channel at capacity
    Full(T),
    /// Channel closed
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the value that could not be sent
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel full"),
            TrySendError::Closed(_) => write!(f, "channel closed"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Error returned by `try_recv`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    #[error("channel empty")]
    Empty,
    #[error("channel closed")]
    Closed,
}
