//! # baton-oplog
//!
//! The operation log records every connection lifecycle event (accept,
//! close, state-changing inbound line). On handover the whole log travels to
//! the successor inside a [`Snapshot`], where [`replay`] rebuilds per-peer
//! session state before the real sockets are attached.
//!
//! ## Modules
//!
//! - `log` - Records and the append-only log
//! - `snapshot` - Versioned handover context blob
//! - `replay` - Replay engine and skeleton reattachment
//! - `error` - Error types

pub mod log;
pub mod snapshot;
pub mod replay;
pub mod error;

pub use log::{monotonic_ns, LogRecord, OperationLog, RecordKind, SharedLog};
pub use snapshot::{ConnCarry, Snapshot, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use replay::{replay, Reattached, ReplayHost, ReplaySession, ReplayStats, Skeletons};
pub use error::{ReplayError, SnapshotError};
