//! Live handover between two server instances, each on its own thread
//! with its own runtime, sharing one state directory.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use baton_chat::{Exit, Server, ServerConfig, ServerError, StateSummary};
use baton_handover::{
    bind_rendezvous, decide_role, hand_over, take_over, FdRole, LockFile, Role, UpgradeError, UpgradePaths,
};
use baton_oplog::{OperationLog, Snapshot, SNAPSHOT_VERSION};
use baton_runtime::{Runtime, RuntimeConfig};

const TIMEOUT: Duration = Duration::from_secs(10);

type Ready = mpsc::Sender<(Vec<SocketAddr>, StateSummary)>;

fn config(dir: &Path) -> ServerConfig {
    ServerConfig {
        listen: vec!["127.0.0.1:0".parse().unwrap()],
        state_dir: dir.to_path_buf(),
        server_name: "srv".into(),
        ack_timeout: Duration::from_secs(5),
        handle_signals: false,
    }
}

/// Start a server on a new thread. It reports its addresses and replayed
/// state on `ready` and shuts down once a byte arrives on `stop`.
fn spawn_server(cfg: ServerConfig, ready: Ready, stop: UnixStream) -> JoinHandle<Exit> {
    thread::spawn(move || {
        let rt = Runtime::new(RuntimeConfig::new()).unwrap();
        let h = rt.handle();
        let server = Server::start(&h, cfg).unwrap();
        ready.send((server.local_addrs(), server.summary())).unwrap();

        let srv = Rc::clone(&server);
        let h2 = h.clone();
        stop.set_nonblocking(true).unwrap();
        h.spawn("stop", async move {
            let mut byte = [0u8; 1];
            if h2.await_readable(stop.as_raw_fd(), || (&stop).read(&mut byte)).await.is_ok() {
                srv.request_shutdown();
            }
        });

        rt.block_on(server.serve()).unwrap().unwrap()
    })
}

struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    fn send(&mut self, line: &str) {
        self.stream.write_all(format!("{}\r\n", line).as_bytes()).unwrap();
    }

    fn line(&mut self) -> String {
        let mut line = String::new();
        assert!(self.reader.read_line(&mut line).unwrap() > 0, "connection closed");
        line.trim_end().to_string()
    }

    /// Read until a line contains `needle`; returns that line
    fn until(&mut self, needle: &str) -> String {
        loop {
            let line = self.line();
            if line.contains(needle) {
                return line;
            }
        }
    }

    fn register(&mut self, nick: &str) {
        self.send(&format!("NICK {}", nick));
        self.send(&format!("USER {} 0 * :{}", nick, nick));
        self.until(" 376 ");
    }

    /// Round trip a PING so every earlier line has been processed
    fn sync(&mut self, token: &str) {
        self.send(&format!("PING :{}", token));
        self.until(&format!("PONG srv :{}", token));
    }
}

/// Queue more output for `target` than loopback sockets buffer
fn flood(from: &mut Client, target: &str, count: usize) {
    let filler = "x".repeat(400);
    let mut batch = String::new();
    for seq in 0..count {
        batch.push_str(&format!("PRIVMSG {} :{} {}\r\n", target, seq, filler));
        if batch.len() > 64 * 1024 {
            from.stream.write_all(batch.as_bytes()).unwrap();
            batch.clear();
        }
    }
    from.stream.write_all(batch.as_bytes()).unwrap();
}

/// Start a successor on `dir` and wait for the current server to leave
fn upgrade(
    dir: &Path,
    ready_tx: Ready,
    ready: &mpsc::Receiver<(Vec<SocketAddr>, StateSummary)>,
    old: JoinHandle<Exit>,
) -> (JoinHandle<Exit>, UnixStream, StateSummary) {
    let (stop_tx, stop) = UnixStream::pair().unwrap();
    let next = spawn_server(config(dir), ready_tx, stop);
    let (_, summary) = ready.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(old.join().unwrap(), Exit::HandedOver);
    (next, stop_tx, summary)
}

#[test]
fn test_join_survives_handover() {
    let dir = tempfile::tempdir().unwrap();
    let (ready_tx, ready) = mpsc::channel();

    let (mut stop_a, stop) = UnixStream::pair().unwrap();
    let a = spawn_server(config(dir.path()), ready_tx.clone(), stop);
    let (addrs, _) = ready.recv_timeout(TIMEOUT).unwrap();

    let mut alice = Client::connect(addrs[0]);
    alice.register("alice");
    alice.send("JOIN #x");
    alice.until(" 366 ");

    let (mut stop_b, stop) = UnixStream::pair().unwrap();
    let b = spawn_server(config(dir.path()), ready_tx, stop);
    let (b_addrs, summary) = ready.recv_timeout(TIMEOUT).unwrap();

    assert_eq!(b_addrs, addrs);
    assert_eq!(summary.users.get("alice").map(String::as_str), Some("alice"));
    assert_eq!(summary.channels["#x"], (None, vec!["alice".to_string()]));
    assert_eq!(a.join().unwrap(), Exit::HandedOver);
    // Already gone; nothing reads it
    let _ = stop_a.write_all(b"x");

    // Same socket, now served by B
    alice.send("PING :after");
    assert_eq!(alice.line(), ":srv PONG srv :after");

    let mut bob = Client::connect(addrs[0]);
    bob.register("bob");
    bob.send("JOIN #x");
    assert_eq!(bob.until(" 353 "), ":srv 353 bob = #x :alice bob");
    assert_eq!(alice.line(), ":bob JOIN :#x");

    stop_b.write_all(b"x").unwrap();
    assert_eq!(b.join().unwrap(), Exit::Shutdown);
    assert_eq!(alice.until("ERROR"), "ERROR :Server shutting down");
    assert!(!dir.path().join("baton.sock").exists());
}

#[test]
fn test_failed_handover_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let paths = UpgradePaths::in_dir(dir.path());
    let (ready_tx, ready) = mpsc::channel();

    let (mut stop_a, stop) = UnixStream::pair().unwrap();
    let a = spawn_server(config(dir.path()), ready_tx, stop);
    let (addrs, _) = ready.recv_timeout(TIMEOUT).unwrap();

    let mut alice = Client::connect(addrs[0]);
    alice.register("alice");
    alice.send("JOIN #x");
    alice.until(" 366 ");

    // Hang up right after connecting
    drop(UnixStream::connect(&paths.rendezvous).unwrap());

    // Take everything, then walk away without acknowledging
    let (inherited, ack) = take_over(&paths, TIMEOUT).unwrap();
    assert_eq!(inherited.clients.len(), 1);
    assert_eq!(inherited.listeners.len(), 1);
    drop(ack);
    drop(inherited);

    alice.send("PING :still-here");
    assert_eq!(alice.line(), ":srv PONG srv :still-here");

    let mut bob = Client::connect(addrs[0]);
    bob.register("bob");
    bob.send("PRIVMSG alice :hi");
    assert_eq!(alice.line(), ":bob PRIVMSG alice :hi");

    stop_a.write_all(b"x").unwrap();
    assert_eq!(a.join().unwrap(), Exit::Shutdown);
}

#[test]
fn test_partial_line_survives_handover() {
    let dir = tempfile::tempdir().unwrap();
    let (ready_tx, ready) = mpsc::channel();
    let (_stop_a, stop) = UnixStream::pair().unwrap();
    let a = spawn_server(config(dir.path()), ready_tx.clone(), stop);
    let (addrs, _) = ready.recv_timeout(TIMEOUT).unwrap();

    let mut alice = Client::connect(addrs[0]);
    alice.register("alice");
    alice.stream.write_all(b"PING :sp").unwrap();
    // Let A read the fragment into its own buffer
    thread::sleep(Duration::from_millis(200));

    let (b, mut stop_b, _) = upgrade(dir.path(), ready_tx, &ready, a);
    alice.stream.write_all(b"lit\r\n").unwrap();
    assert_eq!(alice.line(), ":srv PONG srv :split");

    stop_b.write_all(b"x").unwrap();
    assert_eq!(b.join().unwrap(), Exit::Shutdown);
}

#[test]
fn test_queued_output_survives_handover() {
    const COUNT: usize = 20_000;

    let dir = tempfile::tempdir().unwrap();
    let (ready_tx, ready) = mpsc::channel();
    let (_stop_a, stop) = UnixStream::pair().unwrap();
    let a = spawn_server(config(dir.path()), ready_tx.clone(), stop);
    let (addrs, _) = ready.recv_timeout(TIMEOUT).unwrap();

    let mut alice = Client::connect(addrs[0]);
    alice.register("alice");
    let mut bob = Client::connect(addrs[0]);
    bob.register("bob");

    // alice reads nothing while A still holds most of her output
    flood(&mut bob, "alice", COUNT);
    bob.sync("flooded");

    let (b, mut stop_b, _) = upgrade(dir.path(), ready_tx, &ready, a);

    for seq in 0..COUNT {
        let line = alice.line();
        let expected = format!(":bob PRIVMSG alice :{} ", seq);
        assert!(line.starts_with(&expected), "expected {:?}, got {:?}", expected, &line[..line.len().min(60)]);
    }
    alice.sync("drained");

    stop_b.write_all(b"x").unwrap();
    assert_eq!(b.join().unwrap(), Exit::Shutdown);
}

#[test]
fn test_chained_handover() {
    let dir = tempfile::tempdir().unwrap();
    let (ready_tx, ready) = mpsc::channel();
    let (_stop_a, stop) = UnixStream::pair().unwrap();
    let a = spawn_server(config(dir.path()), ready_tx.clone(), stop);
    let (addrs, _) = ready.recv_timeout(TIMEOUT).unwrap();

    let mut alice = Client::connect(addrs[0]);
    alice.register("alice");
    alice.send("JOIN #y");
    alice.until(" 366 ");

    // B runs on state it replayed, then is itself replaced
    let (b, _stop_b, summary) = upgrade(dir.path(), ready_tx.clone(), &ready, a);
    assert_eq!(summary.channels["#y"].1, vec!["alice".to_string()]);
    alice.send("NICK alice2");
    assert_eq!(alice.line(), ":alice NICK :alice2");

    let (c, mut stop_c, summary) = upgrade(dir.path(), ready_tx, &ready, b);
    assert_eq!(summary.users.get("alice2").map(String::as_str), Some("alice"));
    assert!(!summary.users.contains_key("alice"));
    assert_eq!(summary.channels["#y"], (None, vec!["alice2".to_string()]));

    alice.send("PING :third");
    assert_eq!(alice.line(), ":srv PONG srv :third");

    stop_c.write_all(b"x").unwrap();
    assert_eq!(c.join().unwrap(), Exit::Shutdown);
}

#[test]
fn test_rejected_snapshot_leaves_predecessor_in_charge() {
    let dir = tempfile::tempdir().unwrap();
    let paths = UpgradePaths::in_dir(dir.path());
    let lock = match decide_role(&paths).unwrap() {
        Role::Fresh(lock) => lock,
        Role::Successor => panic!("expected fresh"),
    };
    let rendezvous = bind_rendezvous(&paths.rendezvous).unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    accepted.set_read_timeout(Some(TIMEOUT)).unwrap();

    let mut wrong_version = Snapshot::new(OperationLog::new(), Vec::new());
    wrong_version.version = SNAPSHOT_VERSION + 1;
    let contexts = vec![b"{not json".to_vec(), wrong_version.encode().unwrap()];

    let rt = Runtime::new(RuntimeConfig::new()).unwrap();
    for context in contexts {
        let cfg = config(dir.path());
        let successor = thread::spawn(move || {
            let rt = Runtime::new(RuntimeConfig::new()).unwrap();
            matches!(Server::start(&rt.handle(), cfg), Err(ServerError::Snapshot(_)))
        });

        let (conn, _) = rendezvous.accept().unwrap();
        let err = hand_over(
            &rt.handle(),
            conn,
            &[
                (lock.as_fd(), FdRole::Lock),
                (rendezvous.as_fd(), FdRole::Rendezvous),
                (listener.as_fd(), FdRole::Listener),
                (accepted.as_fd(), FdRole::Client),
            ],
            || Ok::<_, String>(context),
            TIMEOUT,
        )
        .unwrap_err();
        assert!(matches!(err, UpgradeError::NoAck));
        assert!(successor.join().unwrap());
    }

    // The client connection is untouched and still ours
    client.write_all(b"still here\n").unwrap();
    let mut line = String::new();
    BufReader::new(&accepted).read_line(&mut line).unwrap();
    assert_eq!(line, "still here\n");
    assert!(paths.rendezvous.exists());
    assert!(LockFile::try_acquire(&paths.lock).unwrap().is_none());
}

#[test]
fn test_shutdown_does_not_wait_on_stalled_reader() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.ack_timeout = Duration::from_millis(300);
    let (ready_tx, ready) = mpsc::channel();
    let (mut stop_a, stop) = UnixStream::pair().unwrap();
    let a = spawn_server(cfg, ready_tx, stop);
    let (addrs, _) = ready.recv_timeout(TIMEOUT).unwrap();

    let mut alice = Client::connect(addrs[0]);
    alice.register("alice");
    let mut bob = Client::connect(addrs[0]);
    bob.register("bob");

    // alice never reads again, so her writer stays blocked
    flood(&mut bob, "alice", 20_000);
    bob.sync("flooded");

    let started = Instant::now();
    stop_a.write_all(b"x").unwrap();
    assert_eq!(a.join().unwrap(), Exit::Shutdown);
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(bob.until("ERROR"), "ERROR :Server shutting down");
    drop(alice);
}
