//! Task identifier type

use core::fmt;

use crate::constants::TASK_NONE;

/// Unique identifier for a task
///
/// Ids are handed out sequentially by the runtime and never reused within a
/// process. The maximum value (u64::MAX) is reserved as a sentinel for
/// "no task".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Sentinel value indicating no task
    pub const NONE: TaskId = TaskId(TASK_NONE);

    /// Create a new TaskId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        TaskId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == TASK_NONE
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<TaskId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u64> for TaskId {
    #[inline]
    fn from(id: u64) -> Self {
        TaskId(id)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "TaskId(NONE)")
        } else {
            write!(f, "TaskId({})", self.0)
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "-")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_sentinel() {
        assert!(TaskId::NONE.is_none());
        assert_eq!(TaskId::NONE.to_option(), None);
        assert_eq!(TaskId::new(3).to_option(), Some(TaskId::new(3)));
    }

    #[test]
    fn test_display() {
        assert_eq!(TaskId::new(7).to_string(), "#7");
        assert_eq!(TaskId::NONE.to_string(), "-");
        assert_eq!(format!("{:?}", TaskId::new(7)), "TaskId(7)");
    }

    #[test]
    fn test_ordering_follows_spawn_order() {
        assert!(TaskId::new(1) < TaskId::new(2));
        assert_eq!(TaskId::from(9).as_u64(), 9);
    }
}
