//! # baton-chat
//!
//! A small line-oriented chat server (IRC-style registration, channels,
//! private messages) that can hand its live connections to a new process.
//!
//! ## Modules
//!
//! - `message` - Line grammar: parse and format
//! - `state` - Users, channels and per-session outboxes
//! - `session` - Per-connection command handling; replayable
//! - `server` - Sockets, tasks, operation log and upgrade wiring
//! - `error` - Error types

pub mod message;
pub mod state;
pub mod session;
pub mod server;
pub mod error;

pub use message::{Message, LINE_TERMINATOR, MAX_LINE_LEN};
pub use state::{JoinInfo, Outbox, ServerState, SessionId, SharedState, StateSummary};
pub use session::{is_logged, Flow, Session};
pub use server::{Exit, Server, ServerConfig};
pub use error::{ChatError, ServerError};
