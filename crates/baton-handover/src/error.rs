//! Error types for descriptor passing and upgrades

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from the descriptor-passing protocol.
///
/// Every error aborts the whole transfer; descriptors received before the
/// failure are closed, never returned.
#[derive(Debug, Error)]
pub enum PassFdError {
    #[error("descriptor batch is empty")]
    EmptyBatch,

    #[error("{0} descriptors in one batch (max {max})", max = crate::passfd::MAX_FDS)]
    TooManyFds(usize),

    #[error("invalid tag {0:?}: must be 1-{max} bytes without ','", max = crate::passfd::MAX_TAG_LEN)]
    InvalidTag(String),

    #[error("{what} is {len} bytes (max {max})")]
    Oversize { what: &'static str, len: usize, max: usize },

    #[error("peer closed the connection while sending the {0}")]
    Closed(&'static str),

    #[error("{tags} tag(s) for {fds} descriptor(s)")]
    CountMismatch { tags: usize, fds: usize },

    #[error("control message truncated (MSG_CTRUNC)")]
    ControlTruncated,

    #[error("descriptors attached to the context message")]
    FdsOnContextMessage,

    #[error("descriptors arrived more than once")]
    DuplicateRights,

    #[error("descriptor {0} outside [0, RLIMIT_NOFILE)")]
    InvalidFd(i32),

    #[error("tags are not valid UTF-8")]
    TagEncoding,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl PassFdError {
    /// Caller mistakes, detected before any I/O
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            PassFdError::EmptyBatch | PassFdError::TooManyFds(_) | PassFdError::InvalidTag(_)
        ) || matches!(self, PassFdError::Oversize { what, .. } if *what == "outgoing context")
    }
}

/// Errors from role decision and the handover exchange
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The lock is held but nobody listens on the rendezvous socket
    #[error("lock {} is held by another process and {} does not exist", lock.display(), rendezvous.display())]
    LockContention { lock: PathBuf, rendezvous: PathBuf },

    #[error("descriptor transfer failed: {0}")]
    PassFd(#[from] PassFdError),

    #[error("failed to serialize upgrade context: {0}")]
    Serialize(String),

    #[error("successor closed the connection without acknowledging")]
    NoAck,

    #[error("unexpected acknowledgement byte {0:#04x}")]
    BadAck(u8),

    #[error("no acknowledgement within {0:?}")]
    AckTimeout(std::time::Duration),

    /// The predecessor hung up or stalled after our acknowledgement
    #[error("predecessor did not commit the handover")]
    NotCommitted,

    #[error("unexpected commit byte {0:#04x}")]
    BadCommit(u8),

    #[error("unknown descriptor tag {0:?}")]
    UnknownTag(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl UpgradeError {
    /// Startup errors that must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, UpgradeError::LockContention { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(PassFdError::EmptyBatch.is_usage_error());
        assert!(PassFdError::InvalidTag("a,b".into()).is_usage_error());
        assert!(!PassFdError::CountMismatch { tags: 2, fds: 1 }.is_usage_error());
        assert!(!PassFdError::Oversize { what: "incoming context", len: 9, max: 1 }.is_usage_error());

        let e = UpgradeError::LockContention { lock: "/x/baton.lock".into(), rendezvous: "/x/baton.sock".into() };
        assert!(e.is_fatal());
        assert!(e.to_string().contains("baton.sock"));
        assert!(!UpgradeError::NoAck.is_fatal());
    }
}
