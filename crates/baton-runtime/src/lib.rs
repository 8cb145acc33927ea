//! # baton-runtime
//!
//! Single-threaded cooperative runtime: a futures executor driven by a
//! poll(2) reactor, a sleep-timer heap and a self-pipe signal bridge.
//!
//! ```ignore
//! use baton_runtime::{Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::from_env())?;
//! let handle = rt.handle();
//! rt.block_on(async move {
//!     handle.sleep(std::time::Duration::from_millis(10)).await
//! })??;
//! ```
//!
//! ## Modules
//!
//! - `config` - Runtime configuration
//! - `scheduler` - Task table, ready queue, main loop, `Handle` and `JoinHandle`
//! - `io` - PendingIO registry and readiness futures
//! - `timer` - Sleep heap and the `sleep` future
//! - `signal` - Signal bridge
//! - `net` - TCP listener/stream over the reactor

pub mod config;
pub mod scheduler;
pub mod io;
pub mod timer;
pub mod signal;
pub mod net;

mod tls;

pub use config::RuntimeConfig;
pub use scheduler::{Handle, JoinHandle, Runtime, TaskInfo};
pub use io::{PausedIo, Readiness};
pub use timer::Sleep;
pub use signal::{Signal, SignalBridge};
pub use net::{peer_key, TcpListener, TcpStream};
pub use tls::current_task_id;

// Re-export core types
pub use baton_core::{
    channel, unbounded, Direction, Receiver, SchedError, SchedResult, Sender, SuspendPoint, TaskId,
    TaskState,
};
