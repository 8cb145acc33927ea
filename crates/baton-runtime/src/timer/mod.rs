//! Sleep timers
//!
//! `Handle::sleep` parks the calling task in the scheduler's `SleepHeap`.
//! The scheduler pops due timers at the top of every loop iteration and
//! wakes their tasks in deadline order; a timer is never popped early.

mod heap;

pub use heap::{SleepHeap, SleepHeapStats, SleepTimer, TimerHandle};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use baton_core::{kdebug, SchedError, SchedResult, Subsystem, SuspendPoint};

use crate::scheduler::Handle;
use crate::tls;

impl Handle {
    /// Suspend the current task for at least `duration`
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            handle: self.clone(),
            duration,
            timer: None,
        }
    }
}

/// Future returned by [`Handle::sleep`]
pub struct Sleep {
    handle: Handle,
    duration: Duration,
    timer: Option<(TimerHandle, Instant)>,
}

impl Future for Sleep {
    type Output = SchedResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(reason) = tls::cancel_reason() {
            self.release();
            return Poll::Ready(Err(SchedError::Cancelled(reason)));
        }
        let task = tls::current_task_id();
        if task.is_none() {
            return Poll::Ready(Err(SchedError::NoCurrentTask));
        }

        if let Some((timer, deadline)) = self.timer {
            if !self.handle.core.timers.borrow_mut().take_fired(timer) {
                self.handle.set_suspend(task, SuspendPoint::Sleep { deadline });
                return Poll::Pending;
            }
            self.timer = None;
            self.handle.set_suspend(task, SuspendPoint::None);
            return Poll::Ready(Ok(()));
        }

        let deadline = Instant::now() + self.duration;
        let timer = self
            .handle
            .core
            .timers
            .borrow_mut()
            .insert(deadline, task, cx.waker().clone());
        self.timer = Some((timer, deadline));
        self.handle.set_suspend(task, SuspendPoint::Sleep { deadline });
        kdebug!(Subsystem::Scheduler, "task {} sleeping {:?}", task, self.duration);
        Poll::Pending
    }
}

impl Sleep {
    fn release(&mut self) {
        if let Some((timer, _)) = self.timer.take() {
            self.handle.core.timers.borrow_mut().cancel(timer);
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.release();
    }
}
