//! Main scheduler implementation
//!
//! A single-threaded executor plus poll(2) reactor. Each loop iteration:
//!
//! 1. poll every task in the ready queue
//! 2. pop due sleep timers and wake their tasks (deadline order)
//! 3. wait in poll(2) for min(poll ceiling, time to next timer)
//! 4. remove the registration of every ready descriptor and wake its task
//!
//! `EINTR` from poll(2) re-runs the loop; any other poll failure is returned.
//!
//! Tasks are boxed futures in a table keyed by `TaskId`. Wakers only push the
//! id onto a lock-free queue, so they stay `Send + Sync` even though all
//! task state is `Rc`-based and thread-bound.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::future::Future;
use std::io;
use std::panic::Location;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use baton_core::{kdebug, kinfo, SchedError, SchedResult, Subsystem, SuspendPoint, TaskId, TaskState};

use crate::config::RuntimeConfig;
use crate::io::PendingIo;
use crate::timer::SleepHeap;
use crate::tls;

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

struct TaskSlot {
    name: String,
    spawned_at: &'static Location<'static>,
    state: TaskState,
    suspend: SuspendPoint,
    waker: Waker,

    /// `None` while the task is being polled
    future: Option<LocalFuture>,

    /// Pending cancellation reason
    cancel: Option<String>,
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<SegQueue<TaskId>>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

/// State shared by the runtime, its handles and the suspension futures
pub(crate) struct Core {
    config: RuntimeConfig,
    tasks: RefCell<BTreeMap<TaskId, TaskSlot>>,
    next_id: Cell<u64>,
    ready: Arc<SegQueue<TaskId>>,
    pub(crate) io: RefCell<PendingIo>,
    pub(crate) timers: RefCell<SleepHeap>,
}

impl Core {
    fn poll_task(&self, id: TaskId) {
        let (mut future, waker, cancel) = {
            let mut tasks = self.tasks.borrow_mut();
            // Stale wake for a task that is gone, or a re-entrant wake while polling
            let Some(slot) = tasks.get_mut(&id) else { return };
            let Some(future) = slot.future.take() else { return };
            slot.state = TaskState::Running;
            slot.suspend = SuspendPoint::Await;
            (future, slot.waker.clone(), slot.cancel.clone())
        };

        let poll = {
            let _ctx = tls::enter(id, cancel.clone());
            let mut cx = Context::from_waker(&waker);
            future.as_mut().poll(&mut cx)
        };

        let finished = match poll {
            Poll::Ready(()) => Some(TaskState::Finished),
            Poll::Pending if cancel.is_some() => Some(TaskState::Cancelled),
            Poll::Pending => None,
        };

        let mut tasks = self.tasks.borrow_mut();
        match finished {
            None => {
                if let Some(slot) = tasks.get_mut(&id) {
                    slot.state = TaskState::Suspended;
                    slot.future = Some(future);
                }
            }
            Some(state) => {
                let slot = tasks.remove(&id);
                drop(tasks);
                // Dropping runs the task's Drop-based cleanup (registrations, join state)
                drop(future);
                if let Some(slot) = slot {
                    if self.config.debug_logging {
                        kinfo!("task {} ({}) {}", id, slot.name, state);
                    } else {
                        kdebug!(Subsystem::Scheduler, "task {} ({}) {}", id, slot.name, state);
                    }
                }
            }
        }
    }

    fn run_ready(&self) {
        while let Some(id) = self.ready.pop() {
            self.poll_task(id);
        }
    }

    /// Timers, then one poll(2) wait, then dispatch
    fn turn(&self) -> SchedResult<()> {
        let now = Instant::now();
        let due = self.timers.borrow_mut().pop_due(now);
        if !due.is_empty() {
            kdebug!(Subsystem::Scheduler, "{} timer(s) due", due.len());
            for timer in due {
                timer.waker.wake();
            }
            return Ok(());
        }
        if !self.ready.is_empty() {
            return Ok(());
        }

        let next_deadline = self.timers.borrow_mut().next_deadline();
        let timeout = match next_deadline {
            Some(deadline) => deadline.saturating_duration_since(now).min(self.config.poll_ceiling),
            None => self.config.poll_ceiling,
        };

        if self.io.borrow().is_empty() && next_deadline.is_none() {
            return Err(SchedError::Stalled);
        }
        let mut pollfds = self.io.borrow().interest();

        match sys_poll(&mut pollfds, timeout) {
            Ok(0) => Ok(()),
            Ok(n) => {
                let wakers = self.io.borrow_mut().dispatch(&pollfds);
                kdebug!(Subsystem::Io, "poll: {} fd(s) ready, {} task(s) woken", n, wakers.len());
                for w in wakers {
                    w.wake();
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                kdebug!(Subsystem::Scheduler, "poll interrupted, retrying");
                Ok(())
            }
            Err(e) => Err(SchedError::Io(e)),
        }
    }
}

fn sys_poll(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    // Round up so a timer is never woken before its deadline
    let ms = timeout.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap, clonable access to the runtime from inside tasks
#[derive(Clone)]
pub struct Handle {
    pub(crate) core: Rc<Core>,
}

/// Snapshot of one live task, for diagnostics
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub suspend: SuspendPoint,
    pub spawned_at: String,
    pub cancel_requested: bool,
}

impl Handle {
    /// Create a task and poll it once right away.
    ///
    /// Returns after the task reaches its first suspension point or completes.
    #[track_caller]
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let spawned_at = Location::caller();
        let id = TaskId::new(self.core.next_id.get());
        self.core.next_id.set(id.as_u64() + 1);

        let join = Rc::new(RefCell::new(JoinState {
            result: None,
            waker: None,
        }));
        let guard = JoinGuard { state: Rc::clone(&join) };
        let wrapped = async move {
            let guard = guard;
            let output = future.await;
            guard.complete(Ok(output));
        };

        let name = name.into();
        kdebug!(Subsystem::Scheduler, "spawn {} ({}) at {}", id, name, spawned_at);
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            ready: Arc::clone(&self.core.ready),
        }));
        self.core.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                name,
                spawned_at,
                state: TaskState::Ready,
                suspend: SuspendPoint::None,
                waker,
                future: Some(Box::pin(wrapped)),
                cancel: None,
            },
        );

        self.core.poll_task(id);
        JoinHandle { id, state: join }
    }

    /// Inject a cancellation into a task.
    ///
    /// On its next poll every runtime suspension point inside the task fails
    /// with `SchedError::Cancelled(reason)`. A task still pending after that
    /// poll is dropped. Returns false if the task no longer exists.
    pub fn cancel(&self, id: TaskId, reason: impl Into<String>) -> bool {
        let mut tasks = self.core.tasks.borrow_mut();
        let Some(slot) = tasks.get_mut(&id) else {
            return false;
        };
        if slot.cancel.is_none() {
            slot.cancel = Some(reason.into());
        }
        drop(tasks);
        self.core.ready.push(id);
        kdebug!(Subsystem::Scheduler, "cancel requested for {}", id);
        true
    }

    /// Check if a task is still in the table
    pub fn is_alive(&self, id: TaskId) -> bool {
        self.core.tasks.borrow().contains_key(&id)
    }

    /// Task currently being polled
    pub fn current_task(&self) -> TaskId {
        tls::current_task_id()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.core.config
    }

    /// Enumerate live tasks in spawn order
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.core
            .tasks
            .borrow()
            .iter()
            .map(|(id, slot)| TaskInfo {
                id: *id,
                name: slot.name.clone(),
                state: slot.state,
                suspend: slot.suspend,
                spawned_at: slot.spawned_at.to_string(),
                cancel_requested: slot.cancel.is_some(),
            })
            .collect()
    }

    /// Human-readable table of live tasks, one per line
    pub fn dump_tasks(&self) -> String {
        let tasks = self.tasks();
        let mut out = format!("{} task(s)\n", tasks.len());
        for t in tasks {
            let _ = writeln!(
                out,
                "  {:<6} {:<20} {:<9} {:<22} {}{}",
                t.id.to_string(),
                t.name,
                t.state.to_string(),
                t.suspend.to_string(),
                t.spawned_at,
                if t.cancel_requested { " [cancelling]" } else { "" },
            );
        }
        out
    }

    pub(crate) fn set_suspend(&self, id: TaskId, point: SuspendPoint) {
        if let Some(slot) = self.core.tasks.borrow_mut().get_mut(&id) {
            slot.suspend = point;
        }
    }
}

// ============================================================================
// JoinHandle
// ============================================================================

struct JoinState<T> {
    result: Option<SchedResult<T>>,
    waker: Option<Waker>,
}

/// Lives inside the task; reports cancellation if the task is dropped unfinished
struct JoinGuard<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinGuard<T> {
    fn complete(&self, result: SchedResult<T>) {
        let waker = {
            let mut state = self.state.borrow_mut();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            state.waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}

impl<T> Drop for JoinGuard<T> {
    fn drop(&mut self) {
        self.complete(Err(SchedError::Cancelled("task dropped before completion".into())));
    }
}

/// Awaitable handle to a spawned task's output
///
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    id: TaskId,
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().result.is_some()
    }

    fn try_take(&self) -> Option<SchedResult<T>> {
        self.state.borrow_mut().result.take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = SchedResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        match state.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Owns the scheduler core and drives it on the current thread
pub struct Runtime {
    handle: Handle,
}

impl Runtime {
    /// Create a new runtime with the given configuration
    pub fn new(config: RuntimeConfig) -> SchedResult<Self> {
        config.validate()?;
        let core = Core {
            config,
            tasks: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
            ready: Arc::new(SegQueue::new()),
            io: RefCell::new(PendingIo::default()),
            timers: RefCell::new(SleepHeap::new()),
        };
        Ok(Self {
            handle: Handle { core: Rc::new(core) },
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Run `future` as the root task and drive the loop until it finishes.
    ///
    /// Other tasks still alive when the root finishes stay in the table and
    /// are dropped with the runtime.
    pub fn block_on<F>(&self, future: F) -> SchedResult<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        if tls::is_in_task() {
            return Err(SchedError::NestedBlockOn);
        }
        let root = self.handle.spawn("root", future);
        loop {
            self.handle.core.run_ready();
            if let Some(result) = root.try_take() {
                return result;
            }
            self.handle.core.turn()?;
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Futures hold Handles (and so the core); break the cycle explicitly.
        let tasks = std::mem::take(&mut *self.handle.core.tasks.borrow_mut());
        drop(tasks);
        while self.handle.core.ready.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().poll_ceiling(Duration::from_millis(200))).unwrap()
    }

    #[test]
    fn test_block_on_value() {
        let rt = runtime();
        assert_eq!(rt.block_on(async { 40 + 2 }).unwrap(), 42);
    }

    #[test]
    fn test_spawn_runs_to_first_suspension() {
        let rt = runtime();
        let h = rt.handle();
        let hits = Rc::new(Cell::new(0));

        let hits2 = Rc::clone(&hits);
        let h2 = h.clone();
        let join = h.spawn("sleeper", async move {
            hits2.set(1);
            h2.sleep(Duration::from_millis(5)).await.unwrap();
            hits2.set(2);
            7
        });
        // Ran synchronously up to the sleep
        assert_eq!(hits.get(), 1);
        assert!(!join.is_finished());

        let out = rt.block_on(join).unwrap().unwrap();
        assert_eq!(out, 7);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_sleep_order_and_never_early() {
        let rt = runtime();
        let h = rt.handle();
        let order = Rc::new(RefCell::new(Vec::new()));
        let start = Instant::now();

        for (name, ms) in [("c", 30u64), ("a", 10), ("b", 20)] {
            let (h2, order) = (h.clone(), Rc::clone(&order));
            h.spawn(name, async move {
                h2.sleep(Duration::from_millis(ms)).await.unwrap();
                assert!(start.elapsed() >= Duration::from_millis(ms));
                order.borrow_mut().push(name);
            });
        }

        let h2 = h.clone();
        rt.block_on(async move { h2.sleep(Duration::from_millis(40)).await }).unwrap().unwrap();
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_await_readable_and_duplicate_waiter() {
        let rt = runtime();
        let h = rt.handle();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let a = Rc::new(a);
        let fd = a.as_raw_fd();

        let (h1, a1) = (h.clone(), Rc::clone(&a));
        let reader = h.spawn("reader", async move {
            let mut buf = [0u8; 16];
            let n = h1
                .await_readable(fd, || (&*a1).read(&mut buf))
                .await
                .unwrap();
            buf[..n].to_vec()
        });

        // Second reader on the same fd is a usage error
        let h2 = h.clone();
        let dup = h.spawn("dup", async move {
            h2.await_readable(fd, || Ok::<_, io::Error>(())).await
        });
        let err = rt.block_on(dup).unwrap().unwrap().unwrap_err();
        assert!(matches!(err, SchedError::AlreadyWaiting { .. }));

        b.write_all(b"ping").unwrap();
        assert_eq!(rt.block_on(reader).unwrap().unwrap(), b"ping".to_vec());
        assert_eq!(h.pending_io(), 0);
    }

    #[test]
    fn test_cancel_injects_failure() {
        let rt = runtime();
        let h = rt.handle();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let h1 = h.clone();
        let join = h.spawn("blocked", async move {
            let mut buf = [0u8; 4];
            h1.await_readable(fd, || (&a).read(&mut buf)).await
        });
        assert_eq!(h.pending_io(), 1);
        assert!(h.cancel(join.id(), "shutdown"));

        let result = rt.block_on(join).unwrap().unwrap();
        match result {
            Err(SchedError::Cancelled(reason)) => assert_eq!(reason, "shutdown"),
            other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
        }
        assert_eq!(h.pending_io(), 0);
    }

    #[test]
    fn test_cancel_drops_task_parked_on_channel() {
        let rt = runtime();
        let h = rt.handle();
        let (_tx, mut rx) = baton_core::unbounded::<u8>();

        let join = h.spawn("parked", async move { rx.recv().await });
        h.cancel(join.id(), "stop");

        let result = rt.block_on(join).unwrap();
        assert!(matches!(result, Err(SchedError::Cancelled(_))));
        assert!(h.tasks().iter().all(|t| t.name != "parked"));
    }

    #[test]
    fn test_block_on_inside_task_is_rejected() {
        let rt = runtime();
        let nested = rt
            .block_on(async {
                let inner = runtime();
                inner.block_on(async { 1 })
            })
            .unwrap();
        let err = nested.unwrap_err();
        assert!(matches!(err, SchedError::NestedBlockOn));
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_stalled_root_is_reported() {
        let rt = runtime();
        let (_tx, mut rx) = baton_core::unbounded::<u8>();
        let result = rt.block_on(async move { rx.recv().await });
        assert!(matches!(result, Err(SchedError::Stalled)));
    }

    #[test]
    fn test_tasks_and_dump() {
        let rt = runtime();
        let h = rt.handle();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let h1 = h.clone();
        let join = h.spawn("listener", async move {
            let mut buf = [0u8; 1];
            let _ = h1.await_readable(fd, || (&a).read(&mut buf)).await;
        });

        let tasks = h.tasks();
        let info = tasks.iter().find(|t| t.id == join.id()).unwrap();
        assert_eq!(info.state, TaskState::Suspended);
        assert!(matches!(info.suspend, SuspendPoint::Io { fd: f, .. } if f == fd));
        assert!(info.spawned_at.contains("scheduler.rs"));

        let dump = h.dump_tasks();
        assert!(dump.contains("listener"));
        assert!(dump.contains(&format!("read fd={}", fd)));
    }

    #[test]
    fn test_pause_and_resume_io() {
        let rt = runtime();
        let h = rt.handle();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let h1 = h.clone();
        let reader = h.spawn("reader", async move {
            let mut buf = [0u8; 8];
            h1.await_readable(fd, || (&a).read(&mut buf)).await
        });

        let paused = h.pause_io(&[fd]);
        assert_eq!(paused.len(), 1);
        assert_eq!(h.pending_io(), 0);

        b.write_all(b"x").unwrap();
        h.resume_io(paused);
        assert_eq!(h.pending_io(), 1);
        assert_eq!(rt.block_on(reader).unwrap().unwrap().unwrap(), 1);
    }
}
