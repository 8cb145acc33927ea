//! # Server
//!
//! Wires sessions to sockets, the operation log and the upgrade machinery.
//!
//! Every connection runs as two tasks over one [`Conn`]: a reader that cuts
//! input into lines and feeds the [`Session`], and a writer that drains the
//! session's outbox onto the socket. Listeners get one accept task each, and
//! one more task waits on the rendezvous socket for a successor.
//!
//! ```text
//! start ── decide_role ──┬── Fresh:     bind listeners, bind baton.sock
//!                        └── Successor: take_over → decode → replay → ack
//!                                       → reattach → adopt fds
//! serve ── wait for Exit ──┬── Shutdown:   ERROR to everyone, graceful close
//!                          └── HandedOver: leave sockets untouched
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use baton_core::{
    env_get_duration_ms, env_get_list, env_get_str, kdebug, kinfo, kwarn, unbounded, Receiver,
    SchedError, SchedResult, Sender, Subsystem, TaskId,
};
use baton_handover::{
    bind_rendezvous, decide_role, hand_over, take_over, FdRole, Inheritance, LockFile, Role,
    UpgradeError, UpgradePaths,
};
use baton_oplog::{replay, ConnCarry, OperationLog, RecordKind, ReplayHost, ReplaySession, SharedLog, Snapshot};
use baton_runtime::{Handle, JoinHandle, Signal, SignalBridge, TcpListener, TcpStream};

use crate::error::{ChatError, ServerError};
use crate::message::MAX_LINE_LEN;
use crate::session::{Flow, Session};
use crate::state::{ServerState, SessionId, SharedState, StateSummary};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:6667";
pub const DEFAULT_STATE_DIR: &str = "/tmp/batond";
pub const DEFAULT_SERVER_NAME: &str = "baton";
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

const READ_CHUNK: usize = 4096;
const WRITE_CHUNK: usize = 16 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const SHUTDOWN_REASON: &str = "Server shutting down";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Addresses to listen on when starting fresh
    pub listen: Vec<SocketAddr>,

    /// Holds `baton.lock` and `baton.sock`
    pub state_dir: PathBuf,

    /// Source of server replies
    pub server_name: String,

    /// How long either side of a handover waits on the other, and how long
    /// shutdown waits for queued output to drain
    pub ack_timeout: Duration,

    /// Bridge SIGINT/SIGTERM/SIGUSR1 into the runtime
    pub handle_signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.parse::<SocketAddr>().into_iter().collect(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            handle_signals: true,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by environment variables
    ///
    /// - `BATON_LISTEN`: comma-separated socket addresses
    /// - `BATON_STATE_DIR`
    /// - `BATON_SERVER_NAME`
    /// - `BATON_ACK_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let listen: Vec<SocketAddr> = env_get_list("BATON_LISTEN")
            .iter()
            .filter_map(|addr| match addr.parse::<SocketAddr>() {
                Ok(a) => Some(a),
                Err(e) => {
                    kwarn!("BATON_LISTEN: ignoring {:?}: {}", addr, e);
                    None
                }
            })
            .collect();

        Self {
            listen: if listen.is_empty() { defaults.listen } else { listen },
            state_dir: PathBuf::from(env_get_str("BATON_STATE_DIR", DEFAULT_STATE_DIR)),
            server_name: env_get_str("BATON_SERVER_NAME", DEFAULT_SERVER_NAME),
            ack_timeout: env_get_duration_ms("BATON_ACK_TIMEOUT_MS", defaults.ack_timeout),
            handle_signals: defaults.handle_signals,
        }
    }

    pub fn paths(&self) -> UpgradePaths {
        UpgradePaths::in_dir(&self.state_dir)
    }
}

/// Why [`Server::serve`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Connections were closed; the rendezvous socket is gone
    Shutdown,
    /// A successor owns everything now; exit without touching the sockets
    HandedOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Serving,
    Upgrading,
    HandedOver,
    ShuttingDown,
}

// ============================================================================
// Connections
// ============================================================================

struct Conn {
    peer: String,
    stream: TcpStream,
    /// `None` once the connection is retired
    session: RefCell<Option<Session>>,
    /// Bytes read but not yet a complete line
    inbuf: RefCell<Vec<u8>>,
    /// Output taken off the outbox but not yet written
    inflight: RefCell<Vec<u8>>,
    outbox: Sender<String>,
    reader: Cell<Option<TaskId>>,
    writer: RefCell<Option<JoinHandle<()>>>,
}

impl Conn {
    /// Bytes that would be lost if the connection moved right now
    fn carry(&self) -> ConnCarry {
        let mut unsent_output = self.inflight.borrow().clone();
        for line in self.outbox.pending() {
            unsent_output.extend_from_slice(line.as_bytes());
        }
        ConnCarry {
            peer: self.peer.clone(),
            partial_input: self.inbuf.borrow().clone(),
            unsent_output,
        }
    }
}

/// How a reader stopped
enum Ending {
    /// Peer went away or the socket failed; nothing left to flush
    Hangup(String),
    /// Flush queued output, then close
    Graceful(String),
    /// The connection no longer belongs to this reader
    Abandoned,
}

enum NextLine {
    Line(Vec<u8>),
    TooLong,
    Incomplete,
}

fn next_line(inbuf: &mut Vec<u8>) -> NextLine {
    let newline = inbuf.iter().position(|&b| b == b'\n');
    match newline {
        Some(pos) if pos + 1 > MAX_LINE_LEN => NextLine::TooLong,
        Some(pos) => {
            let mut line: Vec<u8> = inbuf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            NextLine::Line(line)
        }
        None if inbuf.len() >= MAX_LINE_LEN => NextLine::TooLong,
        None => NextLine::Incomplete,
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct Server {
    handle: Handle,
    config: ServerConfig,
    paths: UpgradePaths,
    state: SharedState,
    log: SharedLog,
    phase: Cell<Phase>,
    lock: RefCell<Option<LockFile>>,
    rendezvous: RefCell<Option<Rc<UnixListener>>>,
    listeners: RefCell<Vec<Rc<TcpListener>>>,
    conns: RefCell<BTreeMap<String, Rc<Conn>>>,
    /// Accept and rendezvous tasks
    workers: RefCell<Vec<TaskId>>,
    next_session: Cell<u64>,
    exit_tx: Sender<Exit>,
    exit_rx: RefCell<Option<Receiver<Exit>>>,
}

/// Builds replay skeletons that share the server's state and log
struct SkeletonHost<'a> {
    server: &'a Server,
}

impl ReplayHost for SkeletonHost<'_> {
    type Session = Session;

    fn create_skeleton(&mut self, peer: &str) -> Session {
        self.server.new_session(peer)
    }
}

impl Server {
    /// Decide the role and come up either fresh or as a successor.
    ///
    /// A successor has already acknowledged the handover and resumed every
    /// inherited connection by the time this returns.
    pub fn start(handle: &Handle, config: ServerConfig) -> Result<Rc<Server>, ServerError> {
        let (exit_tx, exit_rx) = unbounded();
        let server = Rc::new(Server {
            handle: handle.clone(),
            paths: config.paths(),
            state: ServerState::new(&config.server_name).shared(),
            log: OperationLog::new().shared(),
            config,
            phase: Cell::new(Phase::Serving),
            lock: RefCell::new(None),
            rendezvous: RefCell::new(None),
            listeners: RefCell::new(Vec::new()),
            conns: RefCell::new(BTreeMap::new()),
            workers: RefCell::new(Vec::new()),
            next_session: Cell::new(1),
            exit_tx,
            exit_rx: RefCell::new(Some(exit_rx)),
        });

        match decide_role(&server.paths)? {
            Role::Fresh(lock) => server.start_fresh(lock)?,
            Role::Successor => server.start_successor()?,
        }
        server.spawn_workers();
        Ok(server)
    }

    fn start_fresh(&self, lock: LockFile) -> Result<(), ServerError> {
        if self.config.listen.is_empty() {
            return Err(ServerError::NoListeners);
        }
        *self.lock.borrow_mut() = Some(lock);
        self.bind_listeners()?;

        // Last, so a successor never finds a half-started predecessor
        let rendezvous = bind_rendezvous(&self.paths.rendezvous)?;
        rendezvous.set_nonblocking(true)?;
        *self.rendezvous.borrow_mut() = Some(Rc::new(rendezvous));
        Ok(())
    }

    fn bind_listeners(&self) -> Result<(), ServerError> {
        let mut listeners = self.listeners.borrow_mut();
        for addr in &self.config.listen {
            let listener = TcpListener::bind(&self.handle, *addr)?;
            kinfo!("listening on {}", listener.local_addr()?);
            listeners.push(Rc::new(listener));
        }
        Ok(())
    }

    fn start_successor(self: &Rc<Self>) -> Result<(), ServerError> {
        let (inherited, ack) = take_over(&self.paths, self.config.ack_timeout)?;
        let Inheritance { lock, rendezvous, listeners, clients, context } = inherited;

        // Any error from here until `confirm` drops the ack, and the
        // predecessor keeps serving. `confirm` returns only once the
        // predecessor has committed to exiting.
        let mut snapshot = Snapshot::decode(&context)?;
        let log = std::mem::take(&mut snapshot.log);
        let skeletons = replay(&log, &mut SkeletonHost { server: self })?;
        *self.log.borrow_mut() = log;
        let stats = skeletons.stats();
        kinfo!(
            "replayed {} accept(s), {} message(s), {} close(s), {} skipped; {} session(s) open",
            stats.accepted,
            stats.messages,
            stats.closed,
            stats.skipped,
            skeletons.len()
        );

        if let Err(e) = ack.confirm() {
            skeletons.abandon();
            return Err(e.into());
        }

        let mut streams: HashMap<String, (TcpStream, Sender<String>, Receiver<String>)> = HashMap::new();
        let mut transports = Vec::with_capacity(clients.len());
        for fd in clients {
            let stream = TcpStream::from_owned_fd(&self.handle, fd)?;
            let peer = match stream.peer_key() {
                Ok(peer) => peer,
                Err(e) => {
                    kwarn!("dropping inherited client: {}", e);
                    continue;
                }
            };
            let (tx, rx) = unbounded();
            transports.push((peer.clone(), tx.clone()));
            streams.insert(peer, (stream, tx, rx));
        }

        let reattached = skeletons.reattach(transports);
        for peer in &reattached.orphans {
            self.log.borrow_mut().append(RecordKind::Close, peer, None);
        }
        for (peer, session) in reattached.sessions {
            let Some((stream, tx, rx)) = streams.remove(&peer) else {
                continue;
            };
            let carry = snapshot.take_carry(&peer).unwrap_or_default();
            self.start_conn(stream, session, tx, rx, carry);
        }
        // Sockets without a session close here
        drop(streams);

        if listeners.is_empty() {
            kwarn!("no listener inherited, binding configured addresses");
            self.bind_listeners()?;
        } else {
            let mut adopted = self.listeners.borrow_mut();
            for fd in listeners {
                let listener = TcpListener::from_owned_fd(&self.handle, fd)?;
                kinfo!("adopted listener {}", listener.local_addr()?);
                adopted.push(Rc::new(listener));
            }
        }

        match lock {
            Some(lock) => *self.lock.borrow_mut() = Some(lock),
            None => kwarn!("predecessor did not send {}", self.paths.lock.display()),
        }

        let rendezvous = match rendezvous {
            Some(r) => r,
            None => bind_rendezvous(&self.paths.rendezvous)?,
        };
        rendezvous.set_nonblocking(true)?;
        *self.rendezvous.borrow_mut() = Some(Rc::new(rendezvous));

        kinfo!(
            "took over {} connection(s), {} orphaned, {} unmatched socket(s) closed",
            self.conns.borrow().len(),
            reattached.orphans.len(),
            reattached.unmatched
        );
        Ok(())
    }

    fn spawn_workers(self: &Rc<Self>) {
        let listeners = self.listeners.borrow().clone();
        let mut workers = Vec::with_capacity(listeners.len() + 1);
        for listener in listeners {
            let name = match listener.local_addr() {
                Ok(addr) => format!("accept {}", addr),
                Err(_) => "accept".to_string(),
            };
            workers.push(self.handle.spawn(name, Rc::clone(self).run_acceptor(listener)).id());
        }
        let rendezvous = self.rendezvous.borrow().clone();
        if let Some(listener) = rendezvous {
            workers.push(self.handle.spawn("rendezvous", Rc::clone(self).run_rendezvous(listener)).id());
        }
        self.workers.borrow_mut().extend(workers);
    }

    /// Serve until shut down or handed over.
    pub async fn serve(self: Rc<Self>) -> Result<Exit, ServerError> {
        let exits = self.exit_rx.borrow_mut().take();
        let Some(mut exits) = exits else {
            return Err(ServerError::AlreadyServing);
        };

        if self.config.handle_signals {
            match SignalBridge::install(&self.handle, &[Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1]) {
                Ok((bridge, signals)) => {
                    self.handle.spawn("signals", Rc::clone(&self).run_signals(bridge, signals));
                }
                Err(e) => kwarn!("signals not handled: {}", e),
            }
        }

        let exit = exits.recv().await.unwrap_or(Exit::Shutdown);
        if exit == Exit::Shutdown {
            self.shut_down().await;
        }
        kinfo!("server exiting: {:?}", exit);
        Ok(exit)
    }

    /// Ask [`serve`](Self::serve) to close everything and return
    pub fn request_shutdown(&self) {
        if self.phase.get() == Phase::Serving {
            let _ = self.exit_tx.try_send(Exit::Shutdown);
        }
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .borrow()
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    pub fn summary(&self) -> StateSummary {
        self.state.borrow().summary()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.borrow().len()
    }

    /// Copy of the operation log
    pub fn log(&self) -> OperationLog {
        self.log.borrow().clone()
    }

    pub fn paths(&self) -> &UpgradePaths {
        &self.paths
    }

    fn is_leaving(&self) -> bool {
        matches!(self.phase.get(), Phase::HandedOver | Phase::ShuttingDown)
    }

    fn new_session(&self, peer: &str) -> Session {
        let id = SessionId(self.next_session.get());
        self.next_session.set(id.0 + 1);
        Session::new(id, peer, self.state.clone(), self.log.clone())
    }

    // ---- connections ----

    fn admit(self: &Rc<Self>, stream: TcpStream) -> io::Result<()> {
        let peer = stream.peer_key()?;
        self.log.borrow_mut().append(RecordKind::Accept, &peer, None);
        let mut session = self.new_session(&peer);
        let (tx, rx) = unbounded();
        session.attach_real_transport(tx.clone());
        kinfo!("{} connected", peer);
        self.start_conn(stream, session, tx, rx, ConnCarry::default());
        Ok(())
    }

    fn start_conn(
        self: &Rc<Self>,
        stream: TcpStream,
        session: Session,
        outbox: Sender<String>,
        rx: Receiver<String>,
        carry: ConnCarry,
    ) {
        let peer = session.peer().to_string();
        let conn = Rc::new(Conn {
            peer: peer.clone(),
            stream,
            session: RefCell::new(Some(session)),
            inbuf: RefCell::new(carry.partial_input),
            inflight: RefCell::new(carry.unsent_output),
            outbox,
            reader: Cell::new(None),
            writer: RefCell::new(None),
        });
        self.conns.borrow_mut().insert(peer.clone(), Rc::clone(&conn));

        let writer = self
            .handle
            .spawn(format!("write {}", peer), Rc::clone(self).run_writer(Rc::clone(&conn), rx));
        *conn.writer.borrow_mut() = Some(writer);
        let reader = self
            .handle
            .spawn(format!("read {}", peer), Rc::clone(self).run_reader(Rc::clone(&conn)));
        conn.reader.set(Some(reader.id()));
    }

    async fn run_reader(self: Rc<Self>, conn: Rc<Conn>) {
        let ending = match self.process_input(&conn) {
            Some(ending) => ending,
            None => self.read_lines(&conn).await,
        };
        match ending {
            Ending::Hangup(reason) => self.close_conn(&conn, &reason, false).await,
            Ending::Graceful(reason) => self.close_conn(&conn, &reason, true).await,
            Ending::Abandoned => {}
        }
    }

    async fn read_lines(&self, conn: &Conn) -> Ending {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let result = conn.stream.read(&mut buf).await;
            if self.is_leaving() {
                return Ending::Abandoned;
            }
            let n = match result {
                Ok(0) => return Ending::Hangup("Connection closed".into()),
                Ok(n) => n,
                Err(e) => return Ending::Hangup(format!("Read error: {}", e)),
            };
            conn.inbuf.borrow_mut().extend_from_slice(&buf[..n]);
            if let Some(ending) = self.process_input(conn) {
                return ending;
            }
        }
    }

    /// Feed every complete buffered line to the session
    fn process_input(&self, conn: &Conn) -> Option<Ending> {
        loop {
            let next = next_line(&mut conn.inbuf.borrow_mut());
            let line = match next {
                NextLine::Line(line) => line,
                NextLine::Incomplete => return None,
                NextLine::TooLong => return Some(self.fatal(conn, &ChatError::LineTooLong(MAX_LINE_LEN))),
            };
            let Ok(line) = String::from_utf8(line) else {
                return Some(self.fatal(conn, &ChatError::Encoding));
            };

            let mut session = conn.session.borrow_mut();
            let Some(session) = session.as_mut() else {
                return Some(Ending::Abandoned);
            };
            match session.receive_line(&line) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => return Some(Ending::Graceful("Client quit".into())),
                Err(e) => {
                    kdebug!(Subsystem::Log, "{}: {}", conn.peer, e);
                    session.fail(&e.to_string());
                    return Some(Ending::Graceful(e.to_string()));
                }
            }
        }
    }

    fn fatal(&self, conn: &Conn, err: &ChatError) -> Ending {
        if let Some(session) = conn.session.borrow().as_ref() {
            session.fail(&err.to_string());
        }
        Ending::Graceful(err.to_string())
    }

    async fn run_writer(self: Rc<Self>, conn: Rc<Conn>, mut outbox: Receiver<String>) {
        loop {
            if let Err(e) = self.flush(&conn).await {
                if !e.is_cancelled() && !self.is_leaving() {
                    kdebug!(Subsystem::Io, "write to {} failed: {}", conn.peer, e);
                }
                break;
            }
            let Some(line) = outbox.recv().await else {
                break;
            };
            let mut inflight = conn.inflight.borrow_mut();
            inflight.extend_from_slice(line.as_bytes());
            while let Ok(more) = outbox.try_recv() {
                inflight.extend_from_slice(more.as_bytes());
            }
        }
        conn.outbox.close();
    }

    async fn flush(&self, conn: &Conn) -> SchedResult<()> {
        loop {
            let chunk = {
                let inflight = conn.inflight.borrow();
                if inflight.is_empty() {
                    return Ok(());
                }
                inflight[..inflight.len().min(WRITE_CHUNK)].to_vec()
            };
            let n = conn.stream.write(&chunk).await?;
            if n == 0 {
                return Err(SchedError::Io(io::ErrorKind::WriteZero.into()));
            }
            conn.inflight.borrow_mut().drain(..n);
        }
    }

    /// Retire the connection, then flush (graceful) or drop its output.
    async fn close_conn(&self, conn: &Conn, reason: &str, graceful: bool) {
        self.retire(conn, reason);
        let writer = conn.writer.borrow_mut().take();
        if let Some(writer) = writer {
            if graceful {
                conn.outbox.close();
                let _ = writer.await;
            } else {
                self.handle.cancel(writer.id(), reason);
            }
        }
        if let Err(e) = conn.stream.shutdown() {
            kdebug!(Subsystem::Io, "shutdown {}: {}", conn.peer, e);
        }
    }

    /// Remove from the connection table, log CLOSE and end the session
    fn retire(&self, conn: &Conn, reason: &str) {
        if self.conns.borrow_mut().remove(&conn.peer).is_none() {
            return;
        }
        self.log.borrow_mut().append(RecordKind::Close, &conn.peer, None);
        let session = conn.session.borrow_mut().take();
        if let Some(session) = session {
            session.close(reason);
        }
        kinfo!("{} disconnected: {}", conn.peer, reason);
    }

    async fn run_acceptor(self: Rc<Self>, listener: Rc<TcpListener>) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if self.is_leaving() {
                        return;
                    }
                    if let Err(e) = self.admit(stream) {
                        kwarn!("could not admit connection: {}", e);
                    }
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    kwarn!("accept failed: {}", e);
                    if self.handle.sleep(ACCEPT_BACKOFF).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    // ---- upgrade ----

    async fn run_rendezvous(self: Rc<Self>, listener: Rc<UnixListener>) {
        loop {
            let accepted = self
                .handle
                .await_readable(listener.as_raw_fd(), || listener.accept())
                .await;
            let conn = match accepted {
                Ok((conn, _)) => conn,
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    kwarn!("rendezvous accept failed: {}", e);
                    if self.handle.sleep(ACCEPT_BACKOFF).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            if self.phase.get() != Phase::Serving {
                continue;
            }

            kinfo!("successor connected, handing over {} connection(s)", self.conns.borrow().len());
            self.phase.set(Phase::Upgrading);
            match self.transfer(conn) {
                Ok(()) => {
                    self.phase.set(Phase::HandedOver);
                    self.abandon_io("handed over");
                    let _ = self.exit_tx.try_send(Exit::HandedOver);
                    return;
                }
                Err(e) => {
                    self.phase.set(Phase::Serving);
                    kinfo!("still serving after failed handover ({})", e);
                }
            }
        }
    }

    /// Send every descriptor and the snapshot to the successor on `conn`
    fn transfer(&self, conn: UnixStream) -> Result<(), UpgradeError> {
        let lock = self.lock.borrow();
        let rendezvous = self.rendezvous.borrow().clone();
        let listeners = self.listeners.borrow().clone();
        let conns: Vec<Rc<Conn>> = self.conns.borrow().values().cloned().collect();

        let mut fds: Vec<(BorrowedFd<'_>, FdRole)> = Vec::with_capacity(conns.len() + listeners.len() + 2);
        if let Some(lock) = lock.as_ref() {
            fds.push((lock.as_fd(), FdRole::Lock));
        }
        if let Some(rendezvous) = rendezvous.as_ref() {
            fds.push((rendezvous.as_fd(), FdRole::Rendezvous));
        }
        for listener in &listeners {
            fds.push((listener.as_fd(), FdRole::Listener));
        }
        for c in &conns {
            fds.push((c.stream.as_fd(), FdRole::Client));
        }

        let snapshot = || {
            let carry = conns.iter().map(|c| c.carry()).filter(|c| !c.is_empty()).collect();
            Snapshot::new(self.log.borrow().clone(), carry).encode()
        };
        hand_over(&self.handle, conn, &fds, snapshot, self.config.ack_timeout)
    }

    /// Stop every task that could still touch a socket.
    ///
    /// Cancellation is checked before readiness, so none of them performs
    /// another read, write or accept.
    fn abandon_io(&self, reason: &str) {
        let current = self.handle.current_task();
        let workers: Vec<TaskId> = self.workers.borrow_mut().drain(..).collect();
        for id in workers.into_iter().filter(|id| *id != current) {
            self.handle.cancel(id, reason);
        }
        let conns: Vec<Rc<Conn>> = self.conns.borrow().values().cloned().collect();
        for conn in conns {
            if let Some(id) = conn.reader.get() {
                self.handle.cancel(id, reason);
            }
            let writer = conn.writer.borrow().as_ref().map(|w| w.id());
            if let Some(id) = writer {
                self.handle.cancel(id, reason);
            }
        }
    }

    async fn shut_down(&self) {
        self.phase.set(Phase::ShuttingDown);
        let conns: Vec<Rc<Conn>> = self.conns.borrow().values().cloned().collect();
        kinfo!("shutting down, closing {} connection(s)", conns.len());

        let workers: Vec<TaskId> = self.workers.borrow_mut().drain(..).collect();
        for id in workers {
            self.handle.cancel(id, SHUTDOWN_REASON);
        }
        for conn in &conns {
            if let Some(id) = conn.reader.get() {
                self.handle.cancel(id, SHUTDOWN_REASON);
            }
            if let Some(session) = conn.session.borrow().as_ref() {
                session.fail(SHUTDOWN_REASON);
            }
        }

        // Peers that stop reading must not hold shutdown up forever
        let writers: Vec<TaskId> = conns
            .iter()
            .filter_map(|c| c.writer.borrow().as_ref().map(|w| w.id()))
            .collect();
        let h = self.handle.clone();
        let grace = self.config.ack_timeout;
        let deadline = self.handle.spawn("shutdown deadline", async move {
            if h.sleep(grace).await.is_err() {
                return;
            }
            for id in writers {
                if h.cancel(id, "shutdown deadline passed") {
                    kwarn!("dropping unsent output of writer {} after {:?}", id, grace);
                }
            }
        });

        for conn in &conns {
            self.close_conn(conn, SHUTDOWN_REASON, true).await;
        }
        self.handle.cancel(deadline.id(), "shutdown complete");

        self.rendezvous.borrow_mut().take();
        if let Err(e) = fs::remove_file(&self.paths.rendezvous) {
            if e.kind() != io::ErrorKind::NotFound {
                kwarn!("could not remove {}: {}", self.paths.rendezvous.display(), e);
            }
        }
        self.lock.borrow_mut().take();
    }

    async fn run_signals(self: Rc<Self>, bridge: SignalBridge, mut signals: Receiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            match signal {
                Signal::SIGINT | Signal::SIGTERM => {
                    if self.phase.get() == Phase::Upgrading {
                        kinfo!("{:?} ignored during handover", signal);
                        continue;
                    }
                    kinfo!("{:?} received, shutting down", signal);
                    self.request_shutdown();
                }
                Signal::SIGUSR1 => kinfo!("tasks:\n{}", self.handle.dump_tasks()),
                other => kdebug!(Subsystem::Signal, "ignoring {:?}", other),
            }
        }
        bridge.uninstall();
    }
}
