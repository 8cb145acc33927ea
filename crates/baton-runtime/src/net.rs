//! # TCP sockets driven by the reactor
//!
//! `TcpListener` and `TcpStream` wrap non-blocking std sockets and route
//! every accept/read/write through `await_readable` / `await_writable`, so a
//! task that would block suspends instead:
//!
//! ```ignore
//! let listener = TcpListener::bind(&handle, "127.0.0.1:6667".parse()?)?;
//! loop {
//!     let (stream, peer) = listener.accept().await?;
//!     handle.spawn("session", serve(stream));
//! }
//! ```
//!
//! Both types can be rebuilt from an inherited descriptor (`from_owned_fd`),
//! which is how a successor process adopts sockets handed over to it.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener as StdListener, TcpStream as StdStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use baton_core::{SchedError, SchedResult};

use crate::scheduler::Handle;

/// Pending-connection queue length passed to listen(2)
pub const LISTEN_BACKLOG: libc::c_int = 512;

/// Stable key identifying a connection from both processes' point of view
pub fn peer_key(local: SocketAddr, peer: SocketAddr) -> String {
    format!("{}<->{}", local, peer)
}

/// A TCP listener whose `accept` suspends the calling task.
pub struct TcpListener {
    inner: StdListener,
    handle: Handle,
}

impl TcpListener {
    /// Create, configure, bind and listen.
    pub fn bind(handle: &Handle, addr: SocketAddr) -> io::Result<Self> {
        let fd = bind_socket(&addr)?;
        Self::from_owned_fd(handle, fd)
    }

    /// Adopt an already-listening socket (e.g. one inherited on handover).
    pub fn from_owned_fd(handle: &Handle, fd: OwnedFd) -> io::Result<Self> {
        let inner = StdListener::from(fd);
        inner.set_nonblocking(true)?;
        Ok(Self { inner, handle: handle.clone() })
    }

    /// Accept a connection. Suspends the calling task until a client connects.
    pub async fn accept(&self) -> SchedResult<(TcpStream, SocketAddr)> {
        let (stream, addr) = self
            .handle
            .await_readable(self.inner.as_raw_fd(), || self.inner.accept())
            .await?;
        set_nodelay(stream.as_raw_fd());
        let stream = TcpStream::from_std(&self.handle, stream)?;
        Ok((stream, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsFd for TcpListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

/// Common socket setup: create, setsockopt, bind, listen.
fn bind_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let raw = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // Owned from here on: every early return closes it
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let opt: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of_val(&opt) as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = match addr {
        SocketAddr::V4(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            unsafe {
                libc::bind(
                    raw,
                    &sin as *const _ as *const libc::sockaddr,
                    std::mem::size_of_val(&sin) as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            unsafe {
                libc::bind(
                    raw,
                    &sin6 as *const _ as *const libc::sockaddr,
                    std::mem::size_of_val(&sin6) as libc::socklen_t,
                )
            }
        }
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::listen(raw, LISTEN_BACKLOG) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn set_nodelay(fd: RawFd) {
    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of_val(&opt) as libc::socklen_t,
        );
    }
}

/// A TCP connection whose reads and writes suspend the calling task.
///
/// Reads and writes register in different directions, so one task may read
/// while another writes the same stream.
pub struct TcpStream {
    inner: StdStream,
    handle: Handle,
}

impl TcpStream {
    pub fn from_std(handle: &Handle, stream: StdStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { inner: stream, handle: handle.clone() })
    }

    /// Adopt an inherited connected socket.
    pub fn from_owned_fd(handle: &Handle, fd: OwnedFd) -> io::Result<Self> {
        Self::from_std(handle, StdStream::from(fd))
    }

    /// Read into buffer. Returns bytes read, 0 for EOF.
    pub async fn read(&self, buf: &mut [u8]) -> SchedResult<usize> {
        let inner = &self.inner;
        self.handle
            .await_readable(inner.as_raw_fd(), || (&*inner).read(buf))
            .await
    }

    /// Write buffer (single send). Returns bytes sent.
    pub async fn write(&self, buf: &[u8]) -> SchedResult<usize> {
        let inner = &self.inner;
        self.handle
            .await_writable(inner.as_raw_fd(), || (&*inner).write(buf))
            .await
    }

    /// Write the whole buffer, suspending as often as needed.
    pub async fn write_all(&self, mut buf: &[u8]) -> SchedResult<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(SchedError::Io(io::ErrorKind::WriteZero.into())),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// `"<local><-><peer>"` key for this connection
    pub fn peer_key(&self) -> io::Result<String> {
        Ok(peer_key(self.inner.local_addr()?, self.inner.peer_addr()?))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Shut down both directions (sends FIN to the peer).
    pub fn shutdown(&self) -> io::Result<()> {
        self.inner.shutdown(std::net::Shutdown::Both)
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsFd for TcpStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}
