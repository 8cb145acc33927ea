//! # baton-handover
//!
//! Moving a live server from one process to the next.
//!
//! - `passfd` - tagged descriptor batches plus a context blob over `SCM_RIGHTS`
//! - `lock` - the `flock` that marks the authoritative process
//! - `upgrade` - role decision and both sides of the handover exchange
//! - `error` - Error types

pub mod passfd;
pub mod lock;
pub mod upgrade;
pub mod error;

pub use passfd::{receive_on, recv_fds, send_fds, send_to, FdTag, Received, MAX_FDS};
pub use lock::LockFile;
pub use upgrade::{
    bind_rendezvous, decide_role, hand_over, take_over, FdRole, Inheritance, PendingAck, Role,
    UpgradePaths, ACK_BYTE, COMMIT_BYTE,
};
pub use error::{PassFdError, UpgradeError};
