//! Thread-local task context
//!
//! The scheduler records which task is being polled and whether that task
//! has a pending cancellation, so suspension futures can find both without
//! being handed them explicitly.

use std::cell::{Cell, RefCell};

use baton_core::constants::TASK_NONE;
use baton_core::TaskId;

thread_local! {
    /// Task being polled on this thread
    static CURRENT_TASK: Cell<u64> = const { Cell::new(TASK_NONE) };

    /// Cancellation reason injected into the task being polled
    static CANCEL_REASON: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Restores the previous context on drop, so nested polls (spawn from
/// inside a task) unwind correctly.
pub(crate) struct TaskContext {
    prev_task: u64,
    prev_cancel: Option<String>,
}

/// Mark `id` as the running task until the returned guard is dropped
pub(crate) fn enter(id: TaskId, cancel: Option<String>) -> TaskContext {
    let prev_task = CURRENT_TASK.with(|c| c.replace(id.as_u64()));
    let prev_cancel = CANCEL_REASON.with(|c| c.replace(cancel));
    TaskContext { prev_task, prev_cancel }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        CURRENT_TASK.with(|c| c.set(self.prev_task));
        let prev = self.prev_cancel.take();
        CANCEL_REASON.with(|c| *c.borrow_mut() = prev);
    }
}

/// Get the id of the task currently being polled (`TaskId::NONE` outside a task)
#[inline]
pub fn current_task_id() -> TaskId {
    TaskId::new(CURRENT_TASK.with(|c| c.get()))
}

/// Check if we're running inside a task
#[inline]
pub fn is_in_task() -> bool {
    !current_task_id().is_none()
}

/// Pending cancellation for the current task, if any
pub(crate) fn cancel_reason() -> Option<String> {
    CANCEL_REASON.with(|c| c.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_enter_restores() {
        assert!(!is_in_task());
        {
            let _outer = enter(TaskId::new(1), None);
            assert_eq!(current_task_id(), TaskId::new(1));
            {
                let _inner = enter(TaskId::new(2), Some("stop".into()));
                assert_eq!(current_task_id(), TaskId::new(2));
                assert_eq!(cancel_reason().as_deref(), Some("stop"));
            }
            assert_eq!(current_task_id(), TaskId::new(1));
            assert_eq!(cancel_reason(), None);
        }
        assert!(!is_in_task());
    }
}
