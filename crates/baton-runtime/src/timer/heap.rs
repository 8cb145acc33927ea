//! BinaryHeap-based sleep queue
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) amortized (lazy cancellation)
//! - Pop due: O(k log n) where k = number of due timers
//! - Next deadline: O(1) amortized
//!
//! # Cancellation Strategy
//!
//! Cancelled handles are stored in a HashSet and skipped when they reach
//! the top of the heap. The set is cleared when the heap becomes empty.
//!
//! Timers are only ever removed by the scheduler (`pop_due`); a sleeping task
//! learns that its timer fired through `take_fired`.

use std::collections::{BinaryHeap, HashSet};
use std::task::Waker;
use std::time::Instant;

use baton_core::TaskId;

/// Handle identifying one inserted timer
///
/// Handles increase with insertion order, which is also the tie-break for
/// equal deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// A due (or pending) sleep timer
#[derive(Debug, Clone)]
pub struct SleepTimer {
    pub deadline: Instant,
    pub handle: TimerHandle,
    pub task: TaskId,
    pub waker: Waker,
}

/// Wrapper for heap ordering (min-heap by deadline)
struct HeapEntry(SleepTimer);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.handle == other.0.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: earliest deadline first, then earliest insertion
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.handle.cmp(&self.0.handle),
            ord => ord,
        }
    }
}

/// Min-heap of sleep timers owned by the scheduler
pub struct SleepHeap {
    heap: BinaryHeap<HeapEntry>,

    /// Lazily cancelled handles
    cancelled: HashSet<TimerHandle>,

    /// Popped by the scheduler, not yet observed by the sleeping task
    fired: HashSet<TimerHandle>,

    next_handle: u64,

    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl SleepHeap {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            cancelled: HashSet::new(),
            fired: HashSet::new(),
            next_handle: 0,
            total_inserted: 0,
            total_fired: 0,
            total_cancelled: 0,
        }
    }

    /// Insert a timer for `task`, woken through `waker` once `deadline` passes
    pub fn insert(&mut self, deadline: Instant, task: TaskId, waker: Waker) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.heap.push(HeapEntry(SleepTimer { deadline, handle, task, waker }));
        self.total_inserted += 1;
        handle
    }

    /// Cancel a timer. Returns false if it already fired or was already cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if self.fired.remove(&handle) {
            return false;
        }
        let inserted = self.cancelled.insert(handle);
        if inserted {
            self.total_cancelled += 1;
        }
        inserted
    }

    /// Remove every timer whose deadline is at or before `now`, in deadline order
    pub fn pop_due(&mut self, now: Instant) -> Vec<SleepTimer> {
        let mut due = Vec::new();

        while let Some(top) = self.heap.peek() {
            if top.0.deadline > now {
                break;
            }
            let Some(HeapEntry(timer)) = self.heap.pop() else {
                break;
            };
            if self.cancelled.remove(&timer.handle) {
                continue;
            }
            self.total_fired += 1;
            self.fired.insert(timer.handle);
            due.push(timer);
        }

        if self.heap.is_empty() {
            self.cancelled.clear();
        }

        due
    }

    /// Consume the "fired" mark for a handle
    pub fn take_fired(&mut self, handle: TimerHandle) -> bool {
        self.fired.remove(&handle)
    }

    /// Earliest live deadline; discards cancelled entries sitting on top
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if !self.cancelled.contains(&top.0.handle) {
                return Some(top.0.deadline);
            }
            if let Some(HeapEntry(timer)) = self.heap.pop() {
                self.cancelled.remove(&timer.handle);
            }
        }
        self.cancelled.clear();
        None
    }

    /// Live (non-cancelled) timers
    pub fn len(&self) -> usize {
        self.heap.len().saturating_sub(self.cancelled.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SleepHeapStats {
        SleepHeapStats {
            active: self.len(),
            pending_cancellations: self.cancelled.len(),
            total_inserted: self.total_inserted,
            total_fired: self.total_fired,
            total_cancelled: self.total_cancelled,
        }
    }
}

impl Default for SleepHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for SleepHeap
#[derive(Debug, Clone)]
pub struct SleepHeapStats {
    /// Currently active (non-cancelled) timers
    pub active: usize,
    /// Cancelled but not yet removed from heap
    pub pending_cancellations: usize,
    /// Total timers inserted (lifetime)
    pub total_inserted: u64,
    /// Total timers that fired (lifetime)
    pub total_fired: u64,
    /// Total timers cancelled (lifetime)
    pub total_cancelled: u64,
}
