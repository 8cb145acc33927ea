//! # Upgrade roles and the handover exchange
//!
//! At startup a process decides whether it is the first one (`Fresh`) or a
//! replacement for a running one (`Successor`):
//!
//! | lock        | rendezvous socket | role                     |
//! |-------------|-------------------|--------------------------|
//! | acquired    | any (stale)       | Fresh, stale file removed |
//! | held        | present           | Successor                |
//! | held        | absent            | `LockContention` error   |
//!
//! The successor connects to the rendezvous socket. The running process
//! (the predecessor) accepts, pauses I/O on everything it is about to give
//! away, sends every descriptor plus the serialized context, and waits for a
//! one-byte acknowledgement. It answers the acknowledgement with a commit
//! byte and only then may it exit; any failure before that resumes I/O and
//! leaves it in charge. The successor starts serving only after reading the
//! commit byte, so a predecessor that gave up waiting is never joined by a
//! successor serving the same sockets.
//!
//! ```text
//! successor                     predecessor
//!   connect ───────────────────▶ accept, pause I/O
//!           ◀─────────────────── fds + context
//!   decode, replay
//!   'K' ───────────────────────▶ (or timeout: resume, drop conn)
//!           ◀─────────────────── 'C'
//!   serve                        exit
//! ```
//!
//! If the commit byte is lost after the predecessor sent it, neither side
//! serves. That is the one remaining window and it fails closed.

use std::fmt::Display;
use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use baton_core::{kdebug, kinfo, kwarn, Subsystem};
use baton_runtime::Handle;

use crate::error::UpgradeError;
use crate::lock::LockFile;
use crate::passfd::{recv_fds, send_fds, FdTag};

pub const LOCK_FILE_NAME: &str = "baton.lock";
pub const RENDEZVOUS_FILE_NAME: &str = "baton.sock";

/// Byte the successor sends once it has decoded and replayed the context
pub const ACK_BYTE: u8 = b'K';

/// Byte the predecessor answers `K` with; it owns nothing after sending it
pub const COMMIT_BYTE: u8 = b'C';

/// Filesystem locations shared by every generation of the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePaths {
    pub lock: PathBuf,
    pub rendezvous: PathBuf,
}

impl UpgradePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            lock: dir.join(LOCK_FILE_NAME),
            rendezvous: dir.join(RENDEZVOUS_FILE_NAME),
        }
    }
}

/// Outcome of [`decide_role`]
#[derive(Debug)]
pub enum Role {
    /// Nobody else is running; we hold the lock
    Fresh(LockFile),
    /// A running process should hand over to us
    Successor,
}

pub fn decide_role(paths: &UpgradePaths) -> Result<Role, UpgradeError> {
    if let Some(dir) = paths.lock.parent() {
        fs::create_dir_all(dir)?;
    }
    match LockFile::try_acquire(&paths.lock)? {
        Some(lock) => {
            remove_if_exists(&paths.rendezvous)?;
            kinfo!("no running server found, starting fresh");
            Ok(Role::Fresh(lock))
        }
        None if paths.rendezvous.exists() => {
            kinfo!("server already running, taking over via {}", paths.rendezvous.display());
            Ok(Role::Successor)
        }
        None => Err(UpgradeError::LockContention {
            lock: paths.lock.clone(),
            rendezvous: paths.rendezvous.clone(),
        }),
    }
}

/// Bind the rendezvous listener, replacing a leftover socket file
pub fn bind_rendezvous(path: &Path) -> io::Result<UnixListener> {
    remove_if_exists(path)?;
    UnixListener::bind(path)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            kdebug!(Subsystem::Handover, "removed stale {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// What a transferred descriptor is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdRole {
    Lock,
    Rendezvous,
    Listener,
    Client,
}

impl FdRole {
    pub const fn tag(self) -> &'static str {
        match self {
            FdRole::Lock => "lock",
            FdRole::Rendezvous => "rendezvous",
            FdRole::Listener => "listener",
            FdRole::Client => "client",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "lock" => Some(FdRole::Lock),
            "rendezvous" => Some(FdRole::Rendezvous),
            "listener" => Some(FdRole::Listener),
            "client" => Some(FdRole::Client),
            _ => None,
        }
    }
}

/// Predecessor side: give every descriptor in `fds` to the successor on `conn`.
///
/// I/O registrations on those descriptors are paused first; `snapshot` is
/// called after the pause. Returns once the successor acknowledged and the
/// commit byte went out; from then on the caller owns none of `fds`. On error
/// the registrations are restored and the caller stays authoritative.
pub fn hand_over<F, E>(
    handle: &Handle,
    conn: UnixStream,
    fds: &[(BorrowedFd<'_>, FdRole)],
    snapshot: F,
    ack_timeout: Duration,
) -> Result<(), UpgradeError>
where
    F: FnOnce() -> Result<Vec<u8>, E>,
    E: Display,
{
    let raw: Vec<RawFd> = fds.iter().map(|(fd, _)| fd.as_raw_fd()).collect();
    let paused = handle.pause_io(&raw);
    kdebug!(Subsystem::Handover, "paused {} registration(s) for handover", paused.len());

    let result = send_and_wait(&conn, fds, snapshot, ack_timeout);
    match &result {
        Ok(()) => kinfo!("handover acknowledged, {} descriptor(s) transferred", fds.len()),
        Err(e) => {
            kwarn!("handover failed, resuming service: {}", e);
            handle.resume_io(paused);
        }
    }
    result
}

fn send_and_wait<F, E>(
    conn: &UnixStream,
    fds: &[(BorrowedFd<'_>, FdRole)],
    snapshot: F,
    ack_timeout: Duration,
) -> Result<(), UpgradeError>
where
    F: FnOnce() -> Result<Vec<u8>, E>,
    E: Display,
{
    conn.set_nonblocking(false)?;
    let context = snapshot().map_err(|e| UpgradeError::Serialize(e.to_string()))?;

    let mut tagged = Vec::with_capacity(fds.len());
    for (fd, role) in fds {
        tagged.push((*fd, FdTag::new(role.tag())?));
    }
    send_fds(conn, &tagged, &context)?;

    conn.set_read_timeout(Some(ack_timeout.max(Duration::from_millis(1))))?;
    let mut ack = [0u8; 1];
    let mut stream = conn;
    match stream.read(&mut ack) {
        Ok(0) => return Err(UpgradeError::NoAck),
        Ok(_) if ack[0] == ACK_BYTE => {}
        Ok(_) => return Err(UpgradeError::BadAck(ack[0])),
        Err(e) if is_timeout(&e) => return Err(UpgradeError::AckTimeout(ack_timeout)),
        Err(e) => return Err(e.into()),
    }
    stream.write_all(&[COMMIT_BYTE])?;
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Everything received from a predecessor, sorted by role
#[derive(Debug, Default)]
pub struct Inheritance {
    pub lock: Option<LockFile>,
    pub rendezvous: Option<UnixListener>,
    pub listeners: Vec<OwnedFd>,
    pub clients: Vec<OwnedFd>,
    pub context: Vec<u8>,
}

/// The open rendezvous connection, kept until the successor is ready
#[derive(Debug)]
pub struct PendingAck {
    conn: UnixStream,
}

impl PendingAck {
    /// Tell the predecessor it may exit, then wait for its commit.
    ///
    /// Serve the inherited descriptors only if this returns `Ok`.
    pub fn confirm(self) -> Result<(), UpgradeError> {
        let mut stream = &self.conn;
        stream.write_all(&[ACK_BYTE])?;
        kdebug!(Subsystem::Handover, "handover acknowledged, waiting for commit");

        let mut commit = [0u8; 1];
        match stream.read(&mut commit) {
            Ok(0) => Err(UpgradeError::NotCommitted),
            Ok(_) if commit[0] == COMMIT_BYTE => Ok(()),
            Ok(_) => Err(UpgradeError::BadCommit(commit[0])),
            Err(e) if is_timeout(&e) => Err(UpgradeError::NotCommitted),
            Err(e) => Err(e.into()),
        }
    }
}

/// Successor side: connect to the rendezvous socket and receive the batch.
///
/// `timeout` bounds each read while waiting for the predecessor. Dropping
/// the returned `PendingAck` without confirming aborts the handover.
pub fn take_over(paths: &UpgradePaths, timeout: Duration) -> Result<(Inheritance, PendingAck), UpgradeError> {
    let conn = UnixStream::connect(&paths.rendezvous)?;
    conn.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
    let received = recv_fds(&conn)?;

    let mut inheritance = Inheritance {
        context: received.context,
        ..Inheritance::default()
    };
    for (fd, tag) in received.pairs {
        match FdRole::from_tag(tag.as_str()) {
            Some(FdRole::Lock) => inheritance.lock = Some(LockFile::from_inherited(fd, &paths.lock)),
            Some(FdRole::Rendezvous) => inheritance.rendezvous = Some(UnixListener::from(fd)),
            Some(FdRole::Listener) => inheritance.listeners.push(fd),
            Some(FdRole::Client) => inheritance.clients.push(fd),
            None => return Err(UpgradeError::UnknownTag(tag.as_str().to_string())),
        }
    }
    kinfo!(
        "inherited {} listener(s), {} client(s), {} byte(s) of context",
        inheritance.listeners.len(),
        inheritance.clients.len(),
        inheritance.context.len()
    );
    Ok((inheritance, PendingAck { conn }))
}
