//! Replay engine
//!
//! Rebuilds session state in a successor process from a transferred log.
//! Every ACCEPT creates a skeleton session bound to the peer key, every
//! MESSAGE is fed to that skeleton as if it had just been read from the
//! socket (its output goes nowhere), and every CLOSE tears it down. The
//! skeletons left standing are then matched with the transferred client
//! sockets by peer key and switched over to real I/O.

use std::collections::HashMap;

use baton_core::{kdebug, kwarn, Subsystem};

use crate::error::ReplayError;
use crate::log::{OperationLog, RecordKind};

/// A session that can run without a socket during replay
pub trait ReplaySession {
    /// What the session is switched to once replay is over
    type Transport;

    /// Process one logged input line; any output must be discarded
    fn deliver_replayed_message(&mut self, line: &str);

    /// Replace the discard transport with the real connection
    fn attach_real_transport(&mut self, transport: Self::Transport);

    /// The connection closed (in the log) or never came back
    fn teardown(self);
}

/// Creates skeleton sessions on behalf of the replay engine
pub trait ReplayHost {
    type Session: ReplaySession;

    fn create_skeleton(&mut self, peer: &str) -> Self::Session;
}

/// Counters for one replay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub accepted: usize,
    pub messages: usize,
    pub closed: usize,
    /// MESSAGE or CLOSE records for a peer with no open skeleton
    pub skipped: usize,
}

/// Sessions alive at the end of the log, in accept order
pub struct Skeletons<S> {
    sessions: Vec<(String, S)>,
    stats: ReplayStats,
}

/// Outcome of [`Skeletons::reattach`]
pub struct Reattached<S> {
    /// Sessions now bound to their real transport, in accept order
    pub sessions: Vec<(String, S)>,
    /// Peers whose skeleton had no transferred socket; already torn down
    pub orphans: Vec<String>,
    /// Transferred sockets with no skeleton; dropped
    pub unmatched: usize,
}

/// Replay `log` into `host` in record order.
///
/// Ids must be strictly increasing; otherwise every skeleton built so far is
/// torn down and `ReplayError::OutOfOrder` is returned.
pub fn replay<H: ReplayHost>(log: &OperationLog, host: &mut H) -> Result<Skeletons<H::Session>, ReplayError> {
    let mut sessions: Vec<(String, H::Session)> = Vec::new();
    let mut stats = ReplayStats::default();
    let mut previous: Option<u64> = None;

    for record in log.records() {
        if let Some(prev) = previous {
            if record.id <= prev {
                teardown_all(sessions);
                return Err(ReplayError::OutOfOrder { previous: prev, id: record.id });
            }
        }
        previous = Some(record.id);

        let pos = sessions.iter().position(|(peer, _)| *peer == record.peer);
        match record.kind {
            RecordKind::Accept => {
                if let Some(pos) = pos {
                    kwarn!("replay: second ACCEPT for open peer {}, dropping old session", record.peer);
                    let (_, old) = sessions.remove(pos);
                    old.teardown();
                }
                let skeleton = host.create_skeleton(&record.peer);
                sessions.push((record.peer.clone(), skeleton));
                stats.accepted += 1;
            }
            RecordKind::Message => {
                let Some(payload) = record.payload.as_deref() else {
                    teardown_all(sessions);
                    return Err(ReplayError::MissingPayload { id: record.id });
                };
                match pos {
                    Some(pos) => {
                        sessions[pos].1.deliver_replayed_message(payload);
                        stats.messages += 1;
                    }
                    None => stats.skipped += 1,
                }
            }
            RecordKind::Close => match pos {
                Some(pos) => {
                    let (_, session) = sessions.remove(pos);
                    session.teardown();
                    stats.closed += 1;
                }
                None => stats.skipped += 1,
            },
        }
    }

    kdebug!(
        Subsystem::Log,
        "replayed {} record(s): {:?}, {} session(s) open",
        log.len(),
        stats,
        sessions.len()
    );
    Ok(Skeletons { sessions, stats })
}

fn teardown_all<S: ReplaySession>(sessions: Vec<(String, S)>) {
    for (_, s) in sessions {
        s.teardown();
    }
}

impl<S: ReplaySession> Skeletons<S> {
    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Peer keys of the surviving skeletons
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.sessions.iter().map(|(p, _)| p.as_str())
    }

    /// Match every skeleton with its transferred socket by peer key
    pub fn reattach<I>(self, transports: I) -> Reattached<S>
    where
        I: IntoIterator<Item = (String, S::Transport)>,
    {
        let mut by_peer: HashMap<String, S::Transport> = transports.into_iter().collect();
        let mut sessions = Vec::with_capacity(self.sessions.len());
        let mut orphans = Vec::new();

        for (peer, mut session) in self.sessions {
            match by_peer.remove(&peer) {
                Some(transport) => {
                    session.attach_real_transport(transport);
                    sessions.push((peer, session));
                }
                None => {
                    kwarn!("replay: no socket for {}, tearing session down", peer);
                    session.teardown();
                    orphans.push(peer);
                }
            }
        }

        let unmatched = by_peer.len();
        for peer in by_peer.keys() {
            kwarn!("replay: socket {} has no session, closing", peer);
        }
        drop(by_peer);

        Reattached { sessions, orphans, unmatched }
    }

    /// Tear every skeleton down without attaching anything
    pub fn abandon(self) {
        teardown_all(self.sessions);
    }
}
