//! Error types for the operation log

use thiserror::Error;

/// Failures decoding a handover snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown snapshot magic {0:?}")]
    BadMagic(String),

    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("log next_id {next_id} does not exceed last record id {last_id}")]
    InconsistentLog { next_id: u64, last_id: u64 },
}

/// Failures replaying a log
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Record ids must be strictly increasing
    #[error("record {id} follows record {previous}: ids out of order")]
    OutOfOrder { previous: u64, id: u64 },

    #[error("MESSAGE record {id} has no payload")]
    MissingPayload { id: u64 },
}
