//! # baton-core
//!
//! Core types for the baton cooperative runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The poll(2) reactor, timers and signal plumbing live in `baton-runtime`.
//!
//! ## Modules
//!
//! - `id` - Task identifier type
//! - `state` - Task state and suspension point enums
//! - `channel` - Single-consumer channel with async send/recv
//! - `error` - Error types
//! - `kprint` - Kernel-style log macros and per-subsystem debug toggles
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod channel;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::TaskId;
pub use state::{Direction, SuspendPoint, TaskState};
pub use channel::{channel, unbounded, Receiver, Sender};
pub use error::{SchedError, SchedResult, SendError, TryRecvError, TrySendError};
pub use kprint::Subsystem;
pub use env::{env_get, env_get_bool, env_get_duration_ms, env_get_list, env_get_str};

#[doc(hidden)]
pub use tracing as __tracing;

/// Runtime-wide constants
pub mod constants {
    /// Upper bound on a single reactor wait (the poll ceiling), in milliseconds
    pub const DEFAULT_POLL_CEILING_MS: u64 = 10_000;

    /// Capacity of the signal number queue shared with the signal handler
    pub const DEFAULT_SIGNAL_QUEUE: usize = 64;

    /// No task sentinel value
    pub const TASK_NONE: u64 = u64::MAX;
}
