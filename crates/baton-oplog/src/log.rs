//! Append-only operation log

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use baton_core::{kdebug, Subsystem};

/// Kind of connection event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordKind {
    Accept,
    Close,
    Message,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Accept => write!(f, "ACCEPT"),
            RecordKind::Close => write!(f, "CLOSE"),
            RecordKind::Message => write!(f, "MESSAGE"),
        }
    }
}

/// One logged event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: u64,
    /// CLOCK_MONOTONIC nanoseconds at append time
    pub ts: u64,
    pub kind: RecordKind,
    /// `"<local><-><peer>"` connection key
    pub peer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Ordered records plus the id counter.
///
/// Only ever appended to. A log received on handover keeps its counter, so
/// ids stay unique across the chain of processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLog {
    records: Vec<LogRecord>,
    next_id: u64,
}

/// The log as shared between the server and its sessions
pub type SharedLog = Rc<RefCell<OperationLog>>;

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLog {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            next_id: 1,
        }
    }

    /// Wrap in the shared handle sessions append through
    pub fn shared(self) -> SharedLog {
        Rc::new(RefCell::new(self))
    }

    /// Append a record; returns its id
    pub fn append(&mut self, kind: RecordKind, peer: &str, payload: Option<&str>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let record = LogRecord {
            id,
            ts: monotonic_ns(),
            kind,
            peer: peer.to_string(),
            payload: payload.map(str::to_string),
        };
        kdebug!(
            Subsystem::Log,
            "append id={} ts={} kind={} peer={} payload={:?}",
            record.id,
            record.ts,
            record.kind,
            record.peer,
            record.payload
        );
        self.records.push(record);
        id
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Id the next append will get
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Peers with an ACCEPT and no CLOSE after it, in accept order
    pub fn open_peers(&self) -> Vec<&str> {
        let mut open: Vec<&str> = Vec::new();
        for r in &self.records {
            match r.kind {
                RecordKind::Accept => {
                    open.retain(|p| *p != r.peer);
                    open.push(&r.peer);
                }
                RecordKind::Close => open.retain(|p| *p != r.peer),
                RecordKind::Message => {}
            }
        }
        open
    }
}

/// CLOCK_MONOTONIC in nanoseconds
pub fn monotonic_ns() -> u64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec() as u64),
        // CLOCK_MONOTONIC is always available on supported targets
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_and_timestamps_increase() {
        let mut log = OperationLog::new();
        let a = log.append(RecordKind::Accept, "l<->p1", None);
        let b = log.append(RecordKind::Message, "l<->p1", Some("JOIN #x"));
        let c = log.append(RecordKind::Close, "l<->p1", None);

        assert!(a < b && b < c);
        assert_eq!(log.next_id(), c + 1);
        let ts: Vec<u64> = log.records().iter().map(|r| r.ts).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(log.records()[1].payload.as_deref(), Some("JOIN #x"));
    }

    #[test]
    fn test_counter_survives_serialization() {
        let mut log = OperationLog::new();
        log.append(RecordKind::Accept, "l<->p1", None);
        log.append(RecordKind::Accept, "l<->p2", None);

        let json = serde_json::to_string(&log).unwrap();
        assert!(json.contains("\"ACCEPT\""));
        let mut copy: OperationLog = serde_json::from_str(&json).unwrap();
        assert_eq!(copy, log);
        assert_eq!(copy.append(RecordKind::Close, "l<->p1", None), 3);
    }

    #[test]
    fn test_open_peers() {
        let mut log = OperationLog::new();
        log.append(RecordKind::Accept, "a", None);
        log.append(RecordKind::Accept, "b", None);
        log.append(RecordKind::Message, "a", Some("NICK x"));
        log.append(RecordKind::Close, "a", None);
        log.append(RecordKind::Accept, "c", None);
        assert_eq!(log.open_peers(), vec!["b", "c"]);
    }
}
