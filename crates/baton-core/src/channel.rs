//! Single-consumer channel for task communication
//!
//! Built for the single-threaded runtime: state lives in an `Rc<RefCell<_>>`
//! and waiting is expressed through `Waker`s, so a task that would block on
//! `send` or `recv` suspends instead of blocking the OS thread.
//!
//! Semantics:
//! - FIFO, every value delivered exactly once.
//! - After `close()` (or when the last `Sender` is dropped) buffered values
//!   still drain, then `recv()` yields `None`.
//! - Sending on a closed channel fails with `SendError`.
//! - A bounded channel applies backpressure: `send().await` suspends while full.
//! - One consumer only: `Receiver` is not `Clone` and `recv` takes `&mut self`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{SendError, TryRecvError, TrySendError};

/// Create a bounded channel; `capacity` is clamped to at least 1
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    new_channel(Some(capacity.max(1)))
}

/// Create a channel without a capacity limit
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    new_channel(None)
}

fn new_channel<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
    let inner = Rc::new(RefCell::new(ChannelInner {
        buffer: VecDeque::with_capacity(capacity.unwrap_or(16)),
        capacity,
        closed: false,
        recv_waker: None,
        send_waiters: Vec::new(),
        sender_count: 1,
    }));

    (
        Sender { inner: Rc::clone(&inner) },
        Receiver { inner },
    )
}

/// Sending half of a channel
pub struct Sender<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

/// Receiving half of a channel
pub struct Receiver<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

struct ChannelInner<T> {
    buffer: VecDeque<T>,

    /// `None` for unbounded
    capacity: Option<usize>,

    closed: bool,

    /// The single receiver, when parked on an empty buffer
    recv_waker: Option<Waker>,

    /// Senders parked on a full buffer
    send_waiters: Vec<Waker>,

    sender_count: usize,
}

impl<T> ChannelInner<T> {
    fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.buffer.len() >= cap)
    }

    fn take_send_waiters(&mut self) -> Vec<Waker> {
        std::mem::take(&mut self.send_waiters)
    }
}

fn wake_all(wakers: Vec<Waker>) {
    for w in wakers {
        w.wake();
    }
}

impl<T> Sender<T> {
    /// Send a value, suspending while a bounded channel is full.
    ///
    /// Resolves to `Err(SendError(value))` if the channel is (or becomes) closed.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture { sender: self, value: Some(value) }
    }

    /// Try to send without suspending
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let waker = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(TrySendError::Closed(value));
            }
            if inner.is_full() {
                return Err(TrySendError::Full(value));
            }
            inner.buffer.push_back(value);
            inner.recv_waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
        Ok(())
    }

    /// Close the channel. Buffered values remain receivable.
    pub fn close(&self) {
        close_inner(&self.inner);
    }

    /// Check if the channel is closed
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Get current number of items in the buffer
    pub fn len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().buffer.is_empty()
    }

    /// Get channel capacity (`None` when unbounded)
    pub fn capacity(&self) -> Option<usize> {
        self.inner.borrow().capacity
    }

    /// Copy of the values sent but not yet received, in order
    pub fn pending(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner.borrow().buffer.iter().cloned().collect()
    }
}

fn close_inner<T>(inner: &Rc<RefCell<ChannelInner<T>>>) {
    let (recv, senders) = {
        let mut inner = inner.borrow_mut();
        inner.closed = true;
        (inner.recv_waker.take(), inner.take_send_waiters())
    };
    if let Some(w) = recv {
        w.wake();
    }
    wake_all(senders);
}

/// Future returned by [`Sender::send`]
pub struct SendFuture<'a, T> {
    sender: &'a Sender<T>,
    value: Option<T>,
}

// The value is only ever moved out, never pinned in place.
impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let Some(value) = this.value.take() else {
            return Poll::Ready(Ok(()));
        };

        let waker = {
            let mut inner = this.sender.inner.borrow_mut();
            if inner.closed {
                return Poll::Ready(Err(SendError(value)));
            }
            if inner.is_full() {
                inner.send_waiters.push(cx.waker().clone());
                drop(inner);
                this.value = Some(value);
                return Poll::Pending;
            }
            inner.buffer.push_back(value);
            inner.recv_waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
        Poll::Ready(Ok(()))
    }
}

impl<T> Receiver<T> {
    /// Receive the next value, suspending while the channel is empty.
    ///
    /// Resolves to `None` once the channel is closed and drained.
    pub fn recv(&mut self) -> RecvFuture<'_, T> {
        RecvFuture { receiver: self }
    }

    /// Try to receive without suspending
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        let (value, senders) = {
            let mut inner = self.inner.borrow_mut();
            match inner.buffer.pop_front() {
                Some(v) => (v, inner.take_send_waiters()),
                None if inner.closed => return Err(TryRecvError::Closed),
                None => return Err(TryRecvError::Empty),
            }
        };
        wake_all(senders);
        Ok(value)
    }

    /// Close the channel from the receiving side
    pub fn close(&mut self) {
        close_inner(&self.inner);
    }

    /// Check if the channel is closed
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Get current number of items in the buffer
    pub fn len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().buffer.is_empty()
    }
}

/// Future returned by [`Receiver::recv`]
pub struct RecvFuture<'a, T> {
    receiver: &'a mut Receiver<T>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.try_recv() {
            Ok(v) => Poll::Ready(Some(v)),
            Err(TryRecvError::Closed) => Poll::Ready(None),
            Err(TryRecvError::Empty) => {
                self.receiver.inner.borrow_mut().recv_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.borrow_mut().sender_count += 1;
        Sender { inner: Rc::clone(&self.inner) }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let last = {
            let mut inner = self.inner.borrow_mut();
            inner.sender_count -= 1;
            inner.sender_count == 0
        };
        if last {
            // Last sender dropped, close channel
            close_inner(&self.inner);
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        close_inner(&self.inner);
    }
}
