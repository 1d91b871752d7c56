//! Coroutine context
//!
//! Every coroutine body receives a `Context`. It is the only way for a body to
//! suspend: yielding, waiting on futures, sleeping and timed waits all go
//! through it, so the worker thread is released instead of blocked.

use crate::dispatcher::core::Core;
use crate::dispatcher::PostOptions;
use crate::error::{Error, Result};
use crate::promise::{CoroWait, Future, FutureStatus, SharedFuture};
use crate::scheduler::task::Task;
use crate::scheduler::timer::{TimerKey, TimerThread};
use crate::scheduler::{SuspendReason, TaskId};
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{self, Poll};
use std::time::{Duration, Instant};

// ============================================================================
// Stop token
// ============================================================================

/// Advisory stop signal shared between a submitter and its coroutines
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    /// Create a token in the "running" state
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this token to stop
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether a stop was requested
    pub fn stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

// ============================================================================
// Context
// ============================================================================

/// Handle given to every coroutine body
#[derive(Clone)]
pub struct Context {
    queue: usize,
    task: Weak<Task>,
    core: Arc<Core>,
    stop: Option<StopToken>,
}

impl Context {
    pub(crate) fn new(
        queue: usize,
        task: Weak<Task>,
        core: Arc<Core>,
        stop: Option<StopToken>,
    ) -> Self {
        Self {
            queue,
            task,
            core,
            stop,
        }
    }

    /// Coroutine queue this task runs on (resumption always happens here)
    pub fn queue_id(&self) -> usize {
        self.queue
    }

    /// Id of the running task
    pub fn task_id(&self) -> Option<TaskId> {
        self.task.upgrade().map(|t| t.id())
    }

    /// Run `f` on the coroutine-local slot named `key`.
    ///
    /// Slots start empty and live until the coroutine finishes. A slot
    /// holding a value of another type reads as empty.
    pub fn with_local<T, R>(&self, key: &str, f: impl FnOnce(&mut Option<T>) -> R) -> R
    where
        T: Send + 'static,
    {
        match self.task.upgrade() {
            Some(task) => task.with_local(key, f),
            None => f(&mut None),
        }
    }

    /// Store a coroutine-local value, returning the previous one
    pub fn set_local<T: Send + 'static>(&self, key: &str, value: T) -> Option<T> {
        self.with_local(key, |slot| slot.replace(value))
    }

    /// Copy of a coroutine-local value
    pub fn local<T: Clone + Send + 'static>(&self, key: &str) -> Option<T> {
        self.with_local(key, |slot: &mut Option<T>| slot.clone())
    }

    /// Remove a coroutine-local value
    pub fn take_local<T: Send + 'static>(&self, key: &str) -> Option<T> {
        self.with_local(key, Option::take)
    }

    /// Number of coroutine worker threads of the owning dispatcher
    pub fn coro_thread_count(&self) -> usize {
        self.core.coro_thread_count()
    }

    /// Number of IO worker threads of the owning dispatcher
    pub fn io_thread_count(&self) -> usize {
        self.core.io_thread_count()
    }

    /// Whether this task was asked to stop (its own token or dispatcher shutdown)
    pub fn stop_requested(&self) -> bool {
        self.core.stop_requested() || self.stop.as_ref().is_some_and(|s| s.stop_requested())
    }

    pub(crate) fn set_suspend_reason(&self, reason: SuspendReason) {
        if let Some(task) = self.task.upgrade() {
            task.set_suspend_reason(reason);
        }
    }

    /// Run `inner`, recording `reason` on the task whenever it suspends.
    pub(crate) fn suspend<F: StdFuture + Unpin>(
        &self,
        reason: SuspendReason,
        inner: F,
    ) -> Suspend<'_, F> {
        Suspend {
            ctx: self,
            reason,
            inner,
        }
    }

    // ------------------------------------------------------------------------
    // Suspension points
    // ------------------------------------------------------------------------

    /// Give up the worker; the task goes to the back of its queue.
    pub fn yield_now(&self) -> YieldNow<'_> {
        YieldNow {
            ctx: self,
            yielded: false,
        }
    }

    /// Suspend until `future` is satisfied, then take its value.
    pub async fn wait<T>(&self, future: &Future<T>) -> Result<T> {
        self.suspend(SuspendReason::Future, future.get_async()).await
    }

    /// Suspend until a shared future is satisfied, then clone its value.
    pub async fn wait_shared<T: Clone>(&self, future: &SharedFuture<T>) -> Result<T> {
        self.suspend(SuspendReason::Future, future.get_async()).await
    }

    /// Suspend until `waitable` is ready without consuming anything.
    pub async fn wait_ready<W: CoroWait + ?Sized>(&self, waitable: &W) {
        self.suspend(SuspendReason::Future, Ready { waitable }).await
    }

    /// Suspend until `waitable` is ready or `timeout` elapses.
    pub async fn wait_for<W: CoroWait + ?Sized>(
        &self,
        waitable: &W,
        timeout: Duration,
    ) -> Result<FutureStatus> {
        let timed = WaitFor {
            waitable,
            deadline: Instant::now() + timeout,
            timer: self.core.timer(),
            registered: false,
            key: None,
        };
        Ok(self.suspend(SuspendReason::Future, timed).await)
    }

    /// Wait for every future in order; fails with the first error once all
    /// of them have completed.
    pub async fn wait_all<T>(&self, futures: Vec<Future<T>>) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(futures.len());
        let mut first_error = None;
        for future in &futures {
            match self.wait(future).await {
                Ok(value) => values.push(value),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(values),
        }
    }

    /// Suspend until any of `waitables` is ready and return its index.
    pub async fn wait_any<W: CoroWait>(&self, waitables: &[W]) -> Result<usize> {
        if waitables.is_empty() {
            return Err(Error::NoState);
        }
        Ok(self.suspend(SuspendReason::Future, Any { waitables }).await)
    }

    /// Suspend for `duration`.
    pub fn sleep(&self, duration: Duration) -> Suspend<'_, Sleep> {
        let deadline = Instant::now() + duration;
        self.suspend(
            SuspendReason::Sleep { wake_at: deadline },
            Sleep {
                deadline,
                timer: self.core.timer().clone(),
                registered: false,
                key: None,
            },
        )
    }

    // ------------------------------------------------------------------------
    // Fork
    // ------------------------------------------------------------------------

    /// Start a child coroutine; join it with [`Context::wait`].
    pub fn post<T, F, Fut>(&self, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.core.post(PostOptions::default(), body)
    }

    /// Start a child coroutine with explicit options.
    pub fn post_with<T, F, Fut>(&self, options: PostOptions, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.core.post(options, body)
    }

    /// Run a blocking closure on the IO pool.
    pub fn post_async_io<T, F>(&self, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.core.post_io(PostOptions::default(), body)
    }

    /// Run a blocking closure on the IO pool with explicit options.
    pub fn post_async_io_with<T, F>(&self, options: PostOptions, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.core.post_io(options, body)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("queue", &self.queue)
            .field("task", &self.task_id())
            .finish()
    }
}

// ============================================================================
// Awaitables
// ============================================================================

/// Wrapper that records a suspend reason while its inner future is pending
#[must_use = "futures do nothing unless awaited"]
pub struct Suspend<'a, F> {
    ctx: &'a Context,
    reason: SuspendReason,
    inner: F,
}

impl<F: StdFuture + Unpin> StdFuture for Suspend<'_, F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<F::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(output) => Poll::Ready(output),
            Poll::Pending => {
                self.ctx.set_suspend_reason(self.reason.clone());
                Poll::Pending
            }
        }
    }
}

/// Returned by [`Context::yield_now`]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow<'a> {
    ctx: &'a Context,
    yielded: bool,
}

impl StdFuture for YieldNow<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        self.ctx.set_suspend_reason(SuspendReason::Yield);
        // Waking while running marks the task notified: the worker re-queues it
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Returned by [`Context::sleep`]
pub struct Sleep {
    deadline: Instant,
    timer: Arc<TimerThread>,
    registered: bool,
    key: Option<TimerKey>,
}

impl StdFuture for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }
        if !self.registered {
            self.registered = true;
            self.key = self.timer.register(self.deadline, cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.timer.cancel(key);
        }
    }
}

struct Ready<'a, W: ?Sized> {
    waitable: &'a W,
}

impl<W: CoroWait + ?Sized> StdFuture for Ready<'_, W> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<()> {
        self.waitable.poll_ready(cx)
    }
}

struct WaitFor<'a, W: ?Sized> {
    waitable: &'a W,
    deadline: Instant,
    timer: &'a TimerThread,
    registered: bool,
    key: Option<TimerKey>,
}

impl<W: CoroWait + ?Sized> StdFuture for WaitFor<'_, W> {
    type Output = FutureStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<FutureStatus> {
        if self.waitable.poll_ready(cx).is_ready() {
            return Poll::Ready(FutureStatus::Ready);
        }
        if Instant::now() >= self.deadline {
            return Poll::Ready(FutureStatus::Timeout);
        }
        if !self.registered {
            self.registered = true;
            self.key = self.timer.register(self.deadline, cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<W: ?Sized> Drop for WaitFor<'_, W> {
    fn drop(&mut self) {
        // Finished early: the deadline entry is no longer needed
        if let Some(key) = self.key.take() {
            self.timer.cancel(key);
        }
    }
}

struct Any<'a, W> {
    waitables: &'a [W],
}

impl<W: CoroWait> StdFuture for Any<'_, W> {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<usize> {
        for (index, waitable) in self.waitables.iter().enumerate() {
            if waitable.poll_ready(cx).is_ready() {
                return Poll::Ready(index);
            }
        }
        Poll::Pending
    }
}
