//! # Descriptor passing over a Unix stream socket
//!
//! A batch of open descriptors, each labelled with a short tag, travels
//! together with one opaque context blob. The wire format is two
//! length-prefixed messages:
//!
//! ```text
//! u32 LE  L1 | L1 bytes of context
//! u32 LE  L2 | L2 bytes of ','-joined tags   + SCM_RIGHTS [fd0, fd1, ...]
//! ```
//!
//! All descriptors ride in a single control message attached to the second
//! message. The receiver reads with `recvmsg` throughout, so descriptors
//! attached anywhere are noticed, and rejects a batch that is truncated,
//! mislabelled or attached to the wrong message. On any failure every
//! descriptor received so far is closed.

use std::fs;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use baton_core::{kdebug, Subsystem};

use crate::error::PassFdError;

/// Kernel limit on descriptors per SCM_RIGHTS message (SCM_MAX_FD)
pub const MAX_FDS: usize = 253;

pub const MAX_TAG_LEN: usize = 64;

/// Largest context blob accepted
pub const MAX_CONTEXT_LEN: usize = 64 * 1024 * 1024;

/// Largest tag list accepted
pub const MAX_TAGS_LEN: usize = MAX_FDS * (MAX_TAG_LEN + 1);

const TAG_SEPARATOR: char = ',';

/// A validated descriptor tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FdTag(String);

impl FdTag {
    pub fn new(tag: impl Into<String>) -> Result<Self, PassFdError> {
        let tag = tag.into();
        if tag.is_empty() || tag.len() > MAX_TAG_LEN || tag.contains(TAG_SEPARATOR) {
            return Err(PassFdError::InvalidTag(tag));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FdTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A received batch
#[derive(Debug)]
pub struct Received {
    /// Descriptors in send order with their tags
    pub pairs: Vec<(OwnedFd, FdTag)>,
    pub context: Vec<u8>,
}

fn check_batch(count: usize) -> Result<(), PassFdError> {
    match count {
        0 => Err(PassFdError::EmptyBatch),
        n if n > MAX_FDS => Err(PassFdError::TooManyFds(n)),
        _ => Ok(()),
    }
}

/// Send a batch of tagged descriptors plus `context` on a connected stream.
///
/// The stream must be in blocking mode.
pub fn send_fds(
    stream: &UnixStream,
    fds: &[(BorrowedFd<'_>, FdTag)],
    context: &[u8],
) -> Result<(), PassFdError> {
    check_batch(fds.len())?;
    if context.len() > MAX_CONTEXT_LEN {
        return Err(PassFdError::Oversize {
            what: "outgoing context",
            len: context.len(),
            max: MAX_CONTEXT_LEN,
        });
    }

    let mut writer = stream;
    writer.write_all(&(context.len() as u32).to_le_bytes())?;
    writer.write_all(context)?;

    let tags = fds
        .iter()
        .map(|(_, tag)| tag.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let mut message = Vec::with_capacity(4 + tags.len());
    message.extend_from_slice(&(tags.len() as u32).to_le_bytes());
    message.extend_from_slice(tags.as_bytes());

    let raw: Vec<RawFd> = fds.iter().map(|(fd, _)| fd.as_raw_fd()).collect();
    let sent = send_with_rights(stream, &message, &raw)?;
    // Rights ride on the first byte; the remainder is plain data
    writer.write_all(&message[sent..])?;

    kdebug!(
        Subsystem::Handover,
        "sent {} fd(s) [{}] with {} byte(s) of context",
        raw.len(),
        tags,
        context.len()
    );
    Ok(())
}

/// One `sendmsg` carrying `data` and an SCM_RIGHTS message for `fds`.
/// Returns the number of data bytes the kernel took.
pub(crate) fn send_with_rights(stream: &UnixStream, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let fd_bytes = std::mem::size_of_val(fds);
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if !fds.is_empty() {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
            let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
            for (i, fd) in fds.iter().enumerate() {
                std::ptr::write_unaligned(data_ptr.add(i), *fd);
            }
        }
    }

    loop {
        let n = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, SEND_FLAGS) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receive one batch from a connected stream.
///
/// The stream must be in blocking mode; a read timeout, if set, bounds each
/// individual read.
pub fn recv_fds(stream: &UnixStream) -> Result<Received, PassFdError> {
    let limit = fd_limit()?;
    let mut reader = RightsReader::new(stream);

    let context_len = reader.read_len("context length", MAX_CONTEXT_LEN, "incoming context")?;
    let mut context = vec![0u8; context_len];
    reader.read_exact(&mut context, "context")?;
    if !reader.fds.is_empty() {
        return Err(PassFdError::FdsOnContextMessage);
    }

    let tags_len = reader.read_len("tag length", MAX_TAGS_LEN, "tag list")?;
    let mut tags = vec![0u8; tags_len];
    reader.read_exact(&mut tags, "tag list")?;
    let tags = String::from_utf8(tags).map_err(|_| PassFdError::TagEncoding)?;

    let fds = std::mem::take(&mut reader.fds);
    let tags: Vec<&str> = if tags.is_empty() { Vec::new() } else { tags.split(TAG_SEPARATOR).collect() };
    if tags.len() != fds.len() || fds.is_empty() {
        return Err(PassFdError::CountMismatch { tags: tags.len(), fds: fds.len() });
    }
    for fd in &fds {
        let raw = fd.as_raw_fd();
        if raw < 0 || raw as u64 >= limit {
            return Err(PassFdError::InvalidFd(raw));
        }
    }

    let mut pairs = Vec::with_capacity(fds.len());
    for (fd, tag) in fds.into_iter().zip(tags) {
        pairs.push((fd, FdTag::new(tag)?));
    }

    kdebug!(
        Subsystem::Handover,
        "received {} fd(s) with {} byte(s) of context",
        pairs.len(),
        context.len()
    );
    Ok(Received { pairs, context })
}

fn fd_limit() -> io::Result<u64> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rlim.rlim_cur as u64)
}

/// Exact reads over `recvmsg` that collect any SCM_RIGHTS descriptors
struct RightsReader<'a> {
    stream: &'a UnixStream,
    fds: Vec<OwnedFd>,
    rights_seen: bool,
}

impl<'a> RightsReader<'a> {
    fn new(stream: &'a UnixStream) -> Self {
        Self { stream, fds: Vec::new(), rights_seen: false }
    }

    fn read_len(&mut self, what: &'static str, max: usize, body: &'static str) -> Result<usize, PassFdError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, what)?;
        let len = u32::from_le_bytes(buf) as usize;
        if len > max {
            return Err(PassFdError::Oversize { what: body, len, max });
        }
        Ok(len)
    }

    fn read_exact(&mut self, mut buf: &mut [u8], what: &'static str) -> Result<(), PassFdError> {
        while !buf.is_empty() {
            let n = self.recv(buf)?;
            if n == 0 {
                return Err(PassFdError::Closed(what));
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, PassFdError> {
        let fd_bytes = MAX_FDS * std::mem::size_of::<libc::c_int>();
        let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;

        let n = loop {
            let n = unsafe { libc::recvmsg(self.stream.as_raw_fd(), &mut msg, RECV_FLAGS) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        };

        // Take ownership first so an error below still closes them
        let mut arrived = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let data = libc::CMSG_DATA(cmsg);
                    let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                        / std::mem::size_of::<libc::c_int>();
                    for i in 0..count {
                        let fd: libc::c_int = std::ptr::read_unaligned(
                            data.add(i * std::mem::size_of::<libc::c_int>()) as *const libc::c_int,
                        );
                        if fd >= 0 {
                            arrived.push(OwnedFd::from_raw_fd(fd));
                        }
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(PassFdError::ControlTruncated);
        }
        if !arrived.is_empty() {
            if self.rights_seen {
                return Err(PassFdError::DuplicateRights);
            }
            self.rights_seen = true;
            self.fds = arrived;
        }
        Ok(n)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Connect to `path` and send one batch.
///
/// An empty batch is rejected before connecting.
pub fn send_to(
    path: &Path,
    fds: &[(BorrowedFd<'_>, FdTag)],
    context: &[u8],
) -> Result<(), PassFdError> {
    check_batch(fds.len())?;
    let stream = UnixStream::connect(path)?;
    send_fds(&stream, fds, context)
}

/// Bind `path`, accept exactly one connection and receive one batch from it.
///
/// A leftover socket file at `path` is replaced; the file is removed again
/// once the batch is in.
pub fn receive_on(path: &Path) -> Result<Received, PassFdError> {
    remove_stale(path)?;
    let listener = UnixListener::bind(path)?;
    let result = listener
        .accept()
        .map_err(PassFdError::from)
        .and_then(|(stream, _)| recv_fds(&stream));
    drop(listener);
    remove_stale(path)?;
    result
}

fn remove_stale(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::AsFd;

    fn tag(s: &str) -> FdTag {
        FdTag::new(s).unwrap()
    }

    #[test]
    fn test_tag_validation() {
        assert!(FdTag::new("listener").is_ok());
        assert!(matches!(FdTag::new(""), Err(PassFdError::InvalidTag(_))));
        assert!(matches!(FdTag::new("a,b"), Err(PassFdError::InvalidTag(_))));
        assert!(FdTag::new("x".repeat(MAX_TAG_LEN + 1)).is_err());
    }

    #[test]
    fn test_round_trip_keeps_order_tags_and_context() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (pipe_r, mut pipe_w) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"state").unwrap();

        let context = b"{\"magic\":\"x\",\"blob\":[1,2,3]}".to_vec();
        send_fds(
            &tx,
            &[
                (pipe_r.as_fd(), tag("client")),
                (file.as_fd(), tag("lock")),
                (pipe_r.as_fd(), tag("listener")),
            ],
            &context,
        )
        .unwrap();

        let got = recv_fds(&rx).unwrap();
        assert_eq!(got.context, context);
        let tags: Vec<&str> = got.pairs.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(tags, vec!["client", "lock", "listener"]);

        // Same open file descriptions on the receiving side
        pipe_w.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        let mut received = UnixStream::from(got.pairs.into_iter().next().unwrap().0);
        received.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut s = String::new();
        File::read_to_string(&mut file, &mut s).unwrap();
        assert_eq!(s, "state");
    }

    #[test]
    fn test_empty_batch_rejected_before_connecting() {
        let err = send_to(Path::new("/nonexistent/baton.sock"), &[], b"ctx").unwrap_err();
        assert!(matches!(err, PassFdError::EmptyBatch));
        assert!(err.is_usage_error());

        let (tx, _rx) = UnixStream::pair().unwrap();
        assert!(matches!(send_fds(&tx, &[], b""), Err(PassFdError::EmptyBatch)));
    }

    #[test]
    fn test_tag_count_mismatch() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();

        (&tx).write_all(&0u32.to_le_bytes()).unwrap();
        let mut msg = 3u32.to_le_bytes().to_vec();
        msg.extend_from_slice(b"a,b");
        let n = send_with_rights(&tx, &msg, &[a.as_raw_fd()]).unwrap();
        assert_eq!(n, msg.len());

        assert!(matches!(
            recv_fds(&rx),
            Err(PassFdError::CountMismatch { tags: 2, fds: 1 })
        ));
    }

    #[test]
    fn test_rights_on_context_message_rejected() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();

        let mut msg = 2u32.to_le_bytes().to_vec();
        msg.extend_from_slice(b"{}");
        send_with_rights(&tx, &msg, &[a.as_raw_fd()]).unwrap();

        assert!(matches!(recv_fds(&rx), Err(PassFdError::FdsOnContextMessage)));
    }

    #[test]
    fn test_truncated_length_prefix() {
        let (tx, rx) = UnixStream::pair().unwrap();
        (&tx).write_all(&[7, 0]).unwrap();
        drop(tx);
        assert!(matches!(recv_fds(&rx), Err(PassFdError::Closed("context length"))));
    }

    #[test]
    fn test_oversize_context_length() {
        let (tx, rx) = UnixStream::pair().unwrap();
        (&tx).write_all(&u32::MAX.to_le_bytes()).unwrap();
        assert!(matches!(recv_fds(&rx), Err(PassFdError::Oversize { what: "incoming context", .. })));
    }

    #[test]
    fn test_send_to_and_receive_on() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff.sock");
        let (a, mut b) = UnixStream::pair().unwrap();

        let path2 = path.clone();
        let receiver = std::thread::spawn(move || receive_on(&path2));
        // Retry until the receiver is listening
        let mut tries = 0;
        loop {
            match send_to(&path, &[(a.as_fd(), tag("client"))], b"ctx") {
                Ok(()) => break,
                Err(PassFdError::Io(_)) if tries < 500 => {
                    std::thread::sleep(std::time::Duration::from_millis(2));
                    tries += 1;
                }
                Err(e) => panic!("send_to failed: {}", e),
            }
        }

        let got = receiver.join().unwrap().unwrap();
        assert_eq!(got.context, b"ctx");
        assert_eq!(got.pairs.len(), 1);
        assert!(!path.exists());

        let mut received = UnixStream::from(got.pairs.into_iter().next().unwrap().0);
        received.write_all(b"!").unwrap();
        let mut buf = [0u8; 1];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"!");
    }
}
