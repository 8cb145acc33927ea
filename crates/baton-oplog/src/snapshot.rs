//! Handover snapshot
//!
//! The opaque context blob a predecessor hands to its successor: the whole
//! operation log plus, per open connection, the bytes that had already left
//! the kernel but not yet been consumed (a partial input line) or had been
//! produced but not yet written (queued output).

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::log::OperationLog;

pub const SNAPSHOT_MAGIC: &str = "baton-snapshot";
pub const SNAPSHOT_VERSION: u32 = 1;

/// In-flight bytes of one connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnCarry {
    pub peer: String,
    #[serde(default)]
    pub partial_input: Vec<u8>,
    #[serde(default)]
    pub unsent_output: Vec<u8>,
}

impl ConnCarry {
    pub fn is_empty(&self) -> bool {
        self.partial_input.is_empty() && self.unsent_output.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub magic: String,
    pub version: u32,
    pub log: OperationLog,
    #[serde(default)]
    pub carry: Vec<ConnCarry>,
}

impl Snapshot {
    pub fn new(log: OperationLog, carry: Vec<ConnCarry>) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC.to_string(),
            version: SNAPSHOT_VERSION,
            log,
            carry,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate magic, version and the log's id counter
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)?;
        if snapshot.magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic(snapshot.magic));
        }
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        if let Some(last) = snapshot.log.records().last() {
            if snapshot.log.next_id() <= last.id {
                return Err(SnapshotError::InconsistentLog {
                    next_id: snapshot.log.next_id(),
                    last_id: last.id,
                });
            }
        }
        Ok(snapshot)
    }

    /// Carried bytes for `peer`, removed from the snapshot
    pub fn take_carry(&mut self, peer: &str) -> Option<ConnCarry> {
        let pos = self.carry.iter().position(|c| c.peer == peer)?;
        Some(self.carry.swap_remove(pos))
    }
}
