//! # PendingIO registry and readiness futures
//!
//! The reactor keeps one table per direction mapping a raw descriptor to the
//! single task waiting on it. `await_readable` / `await_writable` register
//! the calling task, suspend, and once poll(2) reports readiness run the
//! caller's operation (recv, accept, send). `WouldBlock` simply re-arms.
//!
//! Invariants:
//! - at most one waiter per descriptor per direction; a second registration
//!   fails with `SchedError::AlreadyWaiting`
//! - the reactor removes a registration before waking its task
//! - dropping a readiness future removes its registration

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use baton_core::{kdebug, Direction, SchedError, SchedResult, Subsystem, SuspendPoint, TaskId};

use crate::scheduler::Handle;
use crate::tls;

pub(crate) struct Waiter {
    task: TaskId,
    token: u64,
    waker: Waker,
}

/// Waiter tables owned by the scheduler core
#[derive(Default)]
pub(crate) struct PendingIo {
    readers: HashMap<RawFd, Waiter>,
    writers: HashMap<RawFd, Waiter>,

    /// Tokens whose descriptor was reported ready but whose future has not run yet
    fired: HashSet<u64>,

    next_token: u64,
}

impl PendingIo {
    fn table(&mut self, direction: Direction) -> &mut HashMap<RawFd, Waiter> {
        match direction {
            Direction::Read => &mut self.readers,
            Direction::Write => &mut self.writers,
        }
    }

    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        direction: Direction,
        task: TaskId,
        waker: Waker,
    ) -> SchedResult<u64> {
        let token = self.next_token;
        let table = self.table(direction);
        if let Some(existing) = table.get(&fd) {
            return Err(SchedError::AlreadyWaiting {
                fd,
                direction,
                holder: existing.task,
            });
        }
        table.insert(fd, Waiter { task, token, waker });
        self.next_token += 1;
        Ok(token)
    }

    pub(crate) fn deregister(&mut self, fd: RawFd, direction: Direction, token: u64) {
        let table = self.table(direction);
        if table.get(&fd).is_some_and(|w| w.token == token) {
            table.remove(&fd);
        }
        self.fired.remove(&token);
    }

    pub(crate) fn take_fired(&mut self, token: u64) -> bool {
        self.fired.remove(&token)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writers.is_empty()
    }

    /// Union of all registrations as a pollfd array
    pub(crate) fn interest(&self) -> Vec<libc::pollfd> {
        let mut events: BTreeMap<RawFd, libc::c_short> = BTreeMap::new();
        for fd in self.readers.keys() {
            *events.entry(*fd).or_default() |= libc::POLLIN;
        }
        for fd in self.writers.keys() {
            *events.entry(*fd).or_default() |= libc::POLLOUT;
        }
        events
            .into_iter()
            .map(|(fd, events)| libc::pollfd { fd, events, revents: 0 })
            .collect()
    }

    /// Remove the registrations poll(2) reported ready; returns the wakers to fire
    pub(crate) fn dispatch(&mut self, pollfds: &[libc::pollfd]) -> Vec<Waker> {
        let mut wake = Vec::new();
        for p in pollfds.iter().filter(|p| p.revents != 0) {
            let failed = p.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
            if failed || p.revents & libc::POLLIN != 0 {
                if let Some(w) = self.readers.remove(&p.fd) {
                    self.fired.insert(w.token);
                    wake.push(w.waker);
                }
            }
            if failed || p.revents & libc::POLLOUT != 0 {
                if let Some(w) = self.writers.remove(&p.fd) {
                    self.fired.insert(w.token);
                    wake.push(w.waker);
                }
            }
        }
        wake
    }
}

/// Registrations taken out of the reactor by [`Handle::pause_io`]
pub struct PausedIo {
    waiters: Vec<(RawFd, Direction, Waiter)>,
}

impl PausedIo {
    /// Number of registrations held
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl Handle {
    /// Suspend until `fd` is readable, then run `op`
    pub fn await_readable<T, F>(&self, fd: RawFd, op: F) -> Readiness<T, F>
    where
        F: FnMut() -> io::Result<T>,
    {
        Readiness::new(self.clone(), fd, Direction::Read, op)
    }

    /// Suspend until `fd` is writable, then run `op`
    pub fn await_writable<T, F>(&self, fd: RawFd, op: F) -> Readiness<T, F>
    where
        F: FnMut() -> io::Result<T>,
    {
        Readiness::new(self.clone(), fd, Direction::Write, op)
    }

    /// Take every registration on `fds` out of the reactor without waking anyone
    pub fn pause_io(&self, fds: &[RawFd]) -> PausedIo {
        let mut io = self.core.io.borrow_mut();
        let mut waiters = Vec::new();
        for &fd in fds {
            for direction in [Direction::Read, Direction::Write] {
                if let Some(w) = io.table(direction).remove(&fd) {
                    waiters.push((fd, direction, w));
                }
            }
        }
        kdebug!(Subsystem::Io, "paused {} registration(s) on {} fd(s)", waiters.len(), fds.len());
        PausedIo { waiters }
    }

    /// Put paused registrations back
    pub fn resume_io(&self, paused: PausedIo) {
        let mut io = self.core.io.borrow_mut();
        for (fd, direction, waiter) in paused.waiters {
            io.table(direction).entry(fd).or_insert(waiter);
        }
    }

    /// Number of live descriptor registrations (both directions)
    pub fn pending_io(&self) -> usize {
        let io = self.core.io.borrow();
        io.readers.len() + io.writers.len()
    }
}

enum Stage {
    Idle,
    Armed(u64),
}

/// Future returned by [`Handle::await_readable`] and [`Handle::await_writable`]
pub struct Readiness<T, F> {
    handle: Handle,
    fd: RawFd,
    direction: Direction,
    op: F,
    stage: Stage,
    _out: std::marker::PhantomData<fn() -> T>,
}

// `op` is only called through `&mut`, never pinned.
impl<T, F> Unpin for Readiness<T, F> {}

impl<T, F> Readiness<T, F> {
    fn new(handle: Handle, fd: RawFd, direction: Direction, op: F) -> Self {
        Self {
            handle,
            fd,
            direction,
            op,
            stage: Stage::Idle,
            _out: std::marker::PhantomData,
        }
    }

    fn release(&mut self) {
        if let Stage::Armed(token) = std::mem::replace(&mut self.stage, Stage::Idle) {
            self.handle
                .core
                .io
                .borrow_mut()
                .deregister(self.fd, self.direction, token);
        }
    }
}

impl<T, F> Future for Readiness<T, F>
where
    F: FnMut() -> io::Result<T>,
{
    type Output = SchedResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Some(reason) = tls::cancel_reason() {
            this.release();
            return Poll::Ready(Err(SchedError::Cancelled(reason)));
        }
        let task = tls::current_task_id();
        if task.is_none() {
            return Poll::Ready(Err(SchedError::NoCurrentTask));
        }

        if let Stage::Armed(token) = this.stage {
            if !this.handle.core.io.borrow_mut().take_fired(token) {
                this.handle.set_suspend(
                    task,
                    SuspendPoint::Io { fd: this.fd, direction: this.direction },
                );
                return Poll::Pending;
            }
            this.stage = Stage::Idle;
            match (this.op)() {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                    kdebug!(Subsystem::Io, "fd {} {} spurious, re-arming", this.fd, this.direction);
                }
                result => {
                    this.handle.set_suspend(task, SuspendPoint::None);
                    return Poll::Ready(result.map_err(SchedError::from));
                }
            }
        }

        let registered = this.handle.core.io.borrow_mut().register(
            this.fd,
            this.direction,
            task,
            cx.waker().clone(),
        );
        match registered {
            Ok(token) => {
                this.stage = Stage::Armed(token);
                this.handle.set_suspend(
                    task,
                    SuspendPoint::Io { fd: this.fd, direction: this.direction },
                );
                kdebug!(Subsystem::Io, "task {} waits on fd {} ({})", task, this.fd, this.direction);
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl<T, F> Drop for Readiness<T, F> {
    fn drop(&mut self) {
        self.release();
    }
}
