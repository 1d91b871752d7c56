//! Read sides of a promise: `Future` (single consumer) and `SharedFuture`.

use crate::error::Result;
use crate::promise::state::SharedState;
use crate::promise::{CoroWait, FutureStatus, ThreadWait};
use crate::scheduler::ensure_blocking_allowed;
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

// ============================================================================
// Future
// ============================================================================

/// Single-consumer read side of a promise.
///
/// The value can be retrieved once, either by blocking (`get`, plain threads
/// only) or by awaiting `get_async` from a coroutine.
pub struct Future<T> {
    state: Arc<SharedState<T>>,
}

impl<T> Future<T> {
    pub(crate) fn from_state(state: Arc<SharedState<T>>) -> Self {
        Self { state }
    }

    /// A future that is already satisfied with `value`
    pub fn ready(value: T) -> Self {
        let state = SharedState::new();
        // A fresh state cannot already be set
        let _ = state.set(Ok(value));
        Self { state }
    }

    /// Block until the result is available and take it.
    ///
    /// Fails with `WrongContext` on a coroutine worker thread and with
    /// `FutureAlreadyRetrieved` on the second call.
    pub fn get(&self) -> Result<T> {
        ensure_blocking_allowed()?;
        self.state.take()
    }

    /// Take the result if available, `PromiseNotSatisfied` otherwise
    pub fn try_get(&self) -> Result<T> {
        self.state.try_take()
    }

    /// Coroutine-side retrieval: suspends instead of blocking.
    pub fn get_async(&self) -> GetAsync<'_, T> {
        GetAsync { future: self }
    }

    /// Whether the future still refers to an unretrieved value
    pub fn valid(&self) -> bool {
        !self.state.is_retrieved()
    }

    /// Whether the result is available without blocking
    pub fn is_ready(&self) -> bool {
        !self.state.is_pending()
    }

    pub(crate) fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        self.state.poll_take(cx)
    }
}

impl<T: Clone> Future<T> {
    /// Convert into a broadcast future readable by many consumers.
    pub fn share(self) -> SharedFuture<T> {
        SharedFuture { state: self.state }
    }
}

impl<T> ThreadWait for Future<T> {
    fn wait(&self) -> Result<()> {
        ensure_blocking_allowed()?;
        self.state.wait()
    }

    fn wait_for(&self, timeout: Duration) -> Result<FutureStatus> {
        ensure_blocking_allowed()?;
        self.state.wait_for(timeout)
    }
}

impl<T> CoroWait for Future<T> {
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.state.poll_ready(cx)
    }

    fn is_ready(&self) -> bool {
        Future::is_ready(self)
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .field("valid", &self.valid())
            .finish()
    }
}

/// Awaitable returned by [`Future::get_async`]
#[must_use = "futures do nothing unless awaited"]
pub struct GetAsync<'a, T> {
    future: &'a Future<T>,
}

impl<T> StdFuture for GetAsync<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.poll_take(cx)
    }
}

// ============================================================================
// SharedFuture
// ============================================================================

/// Broadcast read side: every clone observes the same result.
pub struct SharedFuture<T> {
    state: Arc<SharedState<T>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone> SharedFuture<T> {
    /// Block until the result is available and clone it.
    pub fn get(&self) -> Result<T> {
        ensure_blocking_allowed()?;
        self.state.get_cloned()
    }

    /// Clone the result if available, `PromiseNotSatisfied` otherwise
    pub fn try_get(&self) -> Result<T> {
        self.state.try_get_cloned()
    }

    /// Coroutine-side read: suspends instead of blocking.
    pub fn get_async(&self) -> SharedGetAsync<'_, T> {
        SharedGetAsync { future: self }
    }

    /// Whether the result is available without blocking
    pub fn is_ready(&self) -> bool {
        !self.state.is_pending()
    }
}

impl<T> ThreadWait for SharedFuture<T> {
    fn wait(&self) -> Result<()> {
        ensure_blocking_allowed()?;
        self.state.wait()
    }

    fn wait_for(&self, timeout: Duration) -> Result<FutureStatus> {
        ensure_blocking_allowed()?;
        self.state.wait_for(timeout)
    }
}

impl<T> CoroWait for SharedFuture<T> {
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.state.poll_ready(cx)
    }

    fn is_ready(&self) -> bool {
        !self.state.is_pending()
    }
}

impl<T> fmt::Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFuture")
            .field("ready", &!self.state.is_pending())
            .finish()
    }
}

/// Awaitable returned by [`SharedFuture::get_async`]
#[must_use = "futures do nothing unless awaited"]
pub struct SharedGetAsync<'a, T> {
    future: &'a SharedFuture<T>,
}

impl<T: Clone> StdFuture for SharedGetAsync<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.state.poll_cloned(cx)
    }
}
