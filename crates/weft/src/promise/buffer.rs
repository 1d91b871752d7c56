//! Multi-value buffered promise.
//!
//! The producer pushes any number of values and then closes the buffer.
//! Readers pull values in push order; once the buffer is closed and drained
//! every further pull fails with `BufferClosed` (or with the error the
//! producer set, `BrokenPromise` when it was dropped without closing).

use crate::error::{Error, Result};
use crate::promise::{CoroWait, FutureStatus, ThreadWait};
use crate::scheduler::ensure_blocking_allowed;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future as StdFuture;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

struct BufferInner<T> {
    items: VecDeque<T>,
    closed: bool,
    /// Error reported after drain instead of `BufferClosed`
    error: Option<Error>,
    waiters: Vec<Waker>,
}

impl<T> BufferInner<T> {
    fn has_data(&self) -> bool {
        !self.items.is_empty() || self.closed
    }

    fn pop(&mut self) -> Option<Result<T>> {
        if let Some(item) = self.items.pop_front() {
            return Some(Ok(item));
        }
        if self.closed {
            return Some(Err(self.error.clone().unwrap_or(Error::BufferClosed)));
        }
        None
    }

    fn register(&mut self, waker: &Waker) {
        if !self.waiters.iter().any(|w| w.will_wake(waker)) {
            self.waiters.push(waker.clone());
        }
    }
}

struct BufferState<T> {
    inner: Mutex<BufferInner<T>>,
    ready: Condvar,
}

impl<T> BufferState<T> {
    /// Wake every waiter so each re-checks the buffer. Wakers run after the
    /// lock is released: waking a task into a closed queue drops its frame.
    fn notify(&self, mut inner: MutexGuard<'_, BufferInner<T>>) {
        let waiters = mem::take(&mut inner.waiters);
        drop(inner);
        self.ready.notify_all();
        for waker in waiters {
            waker.wake();
        }
    }

    fn finish(&self, error: Option<Error>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::PromiseAlreadySatisfied);
        }
        inner.closed = true;
        inner.error = error;
        self.notify(inner);
        Ok(())
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Write side of a buffer
pub struct BufferPromise<T> {
    state: Arc<BufferState<T>>,
    future_taken: bool,
}

impl<T> BufferPromise<T> {
    /// Create an open, empty buffer
    pub fn new() -> Self {
        Self {
            state: Arc::new(BufferState {
                inner: Mutex::new(BufferInner {
                    items: VecDeque::new(),
                    closed: false,
                    error: None,
                    waiters: Vec::new(),
                }),
                ready: Condvar::new(),
            }),
            future_taken: false,
        }
    }

    /// Hand out the read side (once)
    pub fn get_future(&mut self) -> Result<BufferFuture<T>> {
        if self.future_taken {
            return Err(Error::FutureAlreadyRetrieved);
        }
        self.future_taken = true;
        Ok(BufferFuture {
            state: self.state.clone(),
        })
    }

    /// Append a value; fails with `BufferingData` after close.
    pub fn push(&self, value: T) -> Result<()> {
        let mut inner = self.state.inner.lock();
        if inner.closed {
            return Err(Error::BufferingData);
        }
        inner.items.push_back(value);
        self.state.notify(inner);
        Ok(())
    }

    /// Close the buffer; readers drain what is left, then see `BufferClosed`.
    pub fn close(&self) -> Result<()> {
        self.state.finish(None)
    }

    /// Close the buffer with an error reported after the remaining values.
    pub fn set_exception(&self, error: Error) -> Result<()> {
        self.state.finish(Some(error))
    }

    /// Whether the buffer no longer accepts values
    pub fn is_closed(&self) -> bool {
        self.state.inner.lock().closed
    }
}

impl<T> Default for BufferPromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for BufferPromise<T> {
    fn drop(&mut self) {
        if self.state.finish(Some(Error::BrokenPromise)).is_ok() {
            log::trace!("buffer promise dropped while open");
        }
    }
}

impl<T> fmt::Debug for BufferPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPromise")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Read side of a buffer; clones compete for values.
pub struct BufferFuture<T> {
    state: Arc<BufferState<T>>,
}

impl<T> Clone for BufferFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> BufferFuture<T> {
    /// Block until a value is available (or the buffer is closed and drained).
    pub fn pull(&self) -> Result<T> {
        ensure_blocking_allowed()?;
        let mut inner = self.state.inner.lock();
        loop {
            if let Some(result) = inner.pop() {
                return result;
            }
            self.state.ready.wait(&mut inner);
        }
    }

    /// Pull without blocking; `PromiseNotSatisfied` when nothing is buffered yet.
    pub fn try_pull(&self) -> Result<T> {
        self.state
            .inner
            .lock()
            .pop()
            .unwrap_or(Err(Error::PromiseNotSatisfied))
    }

    /// Coroutine-side pull: suspends instead of blocking.
    pub fn pull_async(&self) -> PullAsync<'_, T> {
        PullAsync { future: self }
    }

    /// Number of values buffered and not yet pulled
    pub fn len(&self) -> usize {
        self.state.inner.lock().items.len()
    }

    /// Whether no values are buffered right now
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producer closed the buffer
    pub fn is_closed(&self) -> bool {
        self.state.inner.lock().closed
    }

    /// Closed and fully drained
    pub fn is_exhausted(&self) -> bool {
        let inner = self.state.inner.lock();
        inner.closed && inner.items.is_empty()
    }

    fn poll_pull(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut inner = self.state.inner.lock();
        match inner.pop() {
            Some(result) => Poll::Ready(result),
            None => {
                inner.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<T> ThreadWait for BufferFuture<T> {
    fn wait(&self) -> Result<()> {
        ensure_blocking_allowed()?;
        let mut inner = self.state.inner.lock();
        while !inner.has_data() {
            self.state.ready.wait(&mut inner);
        }
        Ok(())
    }

    fn wait_for(&self, timeout: Duration) -> Result<FutureStatus> {
        ensure_blocking_allowed()?;
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.inner.lock();
        while !inner.has_data() {
            if self.state.ready.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        Ok(if inner.has_data() {
            FutureStatus::Ready
        } else {
            FutureStatus::Timeout
        })
    }
}

impl<T> CoroWait for BufferFuture<T> {
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.state.inner.lock();
        if inner.has_data() {
            Poll::Ready(())
        } else {
            inner.register(cx.waker());
            Poll::Pending
        }
    }

    fn is_ready(&self) -> bool {
        self.state.inner.lock().has_data()
    }
}

impl<T> fmt::Debug for BufferFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.inner.lock();
        f.debug_struct("BufferFuture")
            .field("buffered", &inner.items.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Awaitable returned by [`BufferFuture::pull_async`]
#[must_use = "futures do nothing unless awaited"]
pub struct PullAsync<'a, T> {
    future: &'a BufferFuture<T>,
}

impl<T> StdFuture for PullAsync<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.poll_pull(cx)
    }
}
