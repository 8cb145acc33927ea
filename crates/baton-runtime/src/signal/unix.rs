//! Unix self-pipe signal bridge
//!
//! The handler does only async-signal-safe work: push the signal number into a
//! pre-allocated lock-free queue and write one byte to a socket pair. The
//! bridge task waits for the other end to become readable, drains it, pops
//! every queued signal and forwards each one onto a channel.
//!
//! Popping from the queue is an atomic take with respect to the handler, so a
//! signal arriving mid-drain is either seen now or wakes the task again.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;

use crossbeam_queue::ArrayQueue;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};

pub use nix::sys::signal::Signal;

use baton_core::{kdebug, kwarn, unbounded, Receiver, SchedError, SchedResult, Sender, Subsystem, TaskId};

use crate::scheduler::Handle;

/// Signal numbers queued by the handler
static QUEUE: OnceLock<ArrayQueue<i32>> = OnceLock::new();

/// Write end of the self-pipe, -1 when no bridge is installed
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

static INSTALLED: AtomicBool = AtomicBool::new(false);

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "emscripten"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno_location()
        }
    } else if #[cfg(target_os = "android")] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno()
        }
    } else {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__error()
        }
    }
}

extern "C" fn on_signal(signo: libc::c_int) {
    // Must not clobber errno of the interrupted code
    let saved = unsafe { *errno_location() };
    if let Some(queue) = QUEUE.get() {
        // Full queue: the signal is dropped, the wake-up byte still goes out
        let _ = queue.push(signo);
    }
    let fd = NOTIFY_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
    unsafe {
        *errno_location() = saved;
    }
}

fn queue(capacity: usize) -> &'static ArrayQueue<i32> {
    QUEUE.get_or_init(|| ArrayQueue::new(capacity))
}

/// An installed bridge; dropping it restores default dispositions
pub struct SignalBridge {
    signals: Vec<Signal>,
    handle: Handle,
    task: TaskId,
    _notify: OwnedFd,
}

impl SignalBridge {
    /// Install handlers for `signals` and spawn the bridge task.
    ///
    /// Delivered signals arrive on the returned receiver in delivery order.
    /// Only one bridge may exist per process.
    pub fn install(handle: &Handle, signals: &[Signal]) -> SchedResult<(SignalBridge, Receiver<Signal>)> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(SchedError::SignalBridgeInstalled);
        }
        match Self::install_inner(handle, signals) {
            Ok(bridge) => Ok(bridge),
            Err(e) => {
                NOTIFY_FD.store(-1, Ordering::SeqCst);
                restore_defaults(signals);
                INSTALLED.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn install_inner(handle: &Handle, signals: &[Signal]) -> SchedResult<(SignalBridge, Receiver<Signal>)> {
        // Allocate before any handler can run
        queue(handle.config().signal_queue_capacity);

        let (read_end, write_end) = UnixStream::pair()?;
        read_end.set_nonblocking(true)?;
        write_end.set_nonblocking(true)?;
        let notify = OwnedFd::from(write_end);
        NOTIFY_FD.store(notify.as_raw_fd(), Ordering::SeqCst);

        let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::SA_RESTART, SigSet::empty());
        for &sig in signals {
            unsafe { sigaction(sig, &action) }.map_err(io::Error::from)?;
            kdebug!(Subsystem::Signal, "handler installed for {}", sig);
        }

        let (tx, rx) = unbounded();
        let join = handle.spawn("signal-bridge", pump(handle.clone(), read_end, tx));

        Ok((
            SignalBridge {
                signals: signals.to_vec(),
                handle: handle.clone(),
                task: join.id(),
                _notify: notify,
            },
            rx,
        ))
    }

    /// Signals this bridge handles
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// Restore default handlers and stop the bridge task
    pub fn uninstall(self) {
        drop(self);
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        restore_defaults(&self.signals);
        NOTIFY_FD.store(-1, Ordering::SeqCst);
        self.handle.cancel(self.task, "signal bridge removed");
        INSTALLED.store(false, Ordering::SeqCst);
    }
}

fn restore_defaults(signals: &[Signal]) {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for &sig in signals {
        if let Err(e) = unsafe { sigaction(sig, &default) } {
            kwarn!("failed to restore default handler for {}: {}", sig, e);
        }
    }
}

/// Read every pending wake-up byte; `WouldBlock` before any byte means spurious
fn drain(mut sock: &UnixStream) -> io::Result<usize> {
    let mut buf = [0u8; 64];
    let mut total = 0;
    loop {
        match sock.read(&mut buf) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => return Ok(total),
            Err(e) => return Err(e),
        }
    }
}

async fn pump(handle: Handle, read_end: UnixStream, tx: Sender<Signal>) {
    let fd = read_end.as_raw_fd();
    let Some(queue) = QUEUE.get() else { return };
    loop {
        match handle.await_readable(fd, || drain(&read_end)).await {
            Ok(n) => kdebug!(Subsystem::Signal, "woken by {} byte(s)", n),
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                kwarn!("signal bridge stopped: {}", e);
                return;
            }
        }
        while let Some(signo) = queue.pop() {
            match Signal::try_from(signo) {
                Ok(sig) => {
                    kdebug!(Subsystem::Signal, "forwarding {}", sig);
                    if tx.send(sig).await.is_err() {
                        return;
                    }
                }
                Err(_) => kwarn!("ignoring unknown signal number {}", signo),
            }
        }
    }
}
