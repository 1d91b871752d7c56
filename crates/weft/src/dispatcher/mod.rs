//! Dispatcher: the public entry point of the runtime
//!
//! A dispatcher owns one coroutine pool, one IO pool and one timer thread.
//! Submissions are routed to a queue, run to completion (or failure) and
//! their result is bound to the `Future` returned to the caller.

mod chain;
pub(crate) mod core;
mod helpers;

pub use chain::Chain;

use crate::config::Configuration;
use crate::context::{Context, StopToken};
use crate::error::Result;
use crate::frame::{self, FrameAllocator};
use crate::promise::{BufferFuture, BufferPromise, Future};
use crate::scheduler::{QueueId, QueueStatistics};
use crate::sequencer::{Sequencer, SequencerConfiguration};
use self::core::Core;
use std::fmt;
use std::future::Future as StdFuture;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;

/// Which pool a statistics or size query targets
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueType {
    /// Coroutine queues
    Coro,
    /// IO queues
    Io,
    /// Both pools
    All,
}

/// How [`Dispatcher::terminate`] treats outstanding work
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TerminateMode {
    /// Stop accepting work, wait for every live task, then stop the workers
    Drain,
    /// Stop the workers after their current poll and cancel queued tasks
    Now,
}

/// Per-submission options
#[derive(Debug, Clone, Default)]
pub struct PostOptions {
    /// Target queue
    pub queue: QueueId,
    /// Put the task at the front of its ready list
    pub high_priority: bool,
    /// Stop signal visible through [`Context::stop_requested`]
    pub stop_token: Option<StopToken>,
}

impl PostOptions {
    /// Default options (any queue, normal priority)
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the target queue
    pub fn queue(mut self, queue: impl Into<QueueId>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Mark the submission high priority
    pub fn high_priority(mut self, high_priority: bool) -> Self {
        self.high_priority = high_priority;
        self
    }

    /// Attach a stop token
    pub fn stop_token(mut self, token: StopToken) -> Self {
        self.stop_token = Some(token);
        self
    }
}

/// Runtime façade: posts coroutines and IO jobs, drains and terminates.
///
/// Dropping the dispatcher terminates it immediately (`TerminateMode::Now`).
pub struct Dispatcher {
    core: Arc<Core>,
}

impl Dispatcher {
    /// Start a dispatcher with the allocator named in `config`
    pub fn new(config: Configuration) -> Result<Self> {
        let allocator = frame::alloc::from_config(&config.frame_allocator)?;
        Self::with_allocator(config, allocator)
    }

    /// Start a dispatcher with a custom frame allocator
    pub fn with_allocator(
        config: Configuration,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Self> {
        Ok(Self {
            core: Core::start(&config, allocator)?,
        })
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    // ========================================================================
    // Posting
    // ========================================================================

    /// Run `body` as a coroutine on any queue.
    pub fn post<T, F, Fut>(&self, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.core.post(PostOptions::default(), body)
    }

    /// Run `body` as a coroutine with explicit options.
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

    /// Run a producer coroutine that streams values through a buffer.
    ///
    /// The body owns the `BufferPromise`; readers see `BrokenPromise` after
    /// draining if the body returns without closing it.
    pub fn post_buffered<T, F, Fut>(&self, body: F) -> Result<BufferFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context, BufferPromise<T>) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<()>> + Send + 'static,
    {
        self.post_buffered_with(PostOptions::default(), body)
    }

    /// [`Dispatcher::post_buffered`] with explicit options.
    pub fn post_buffered_with<T, F, Fut>(
        &self,
        options: PostOptions,
        body: F,
    ) -> Result<BufferFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context, BufferPromise<T>) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<()>> + Send + 'static,
    {
        let mut promise = BufferPromise::new();
        let future = promise.get_future()?;
        self.core
            .post(options, move |ctx| body(ctx, promise))
            .map(|_| future)
    }

    /// Start a continuation chain; see [`Chain`].
    pub fn post_first<T, F, Fut>(&self, body: F) -> Chain<T>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        Chain::new(self.core.clone(), PostOptions::default(), body)
    }

    /// Start a continuation chain with explicit options.
    pub fn post_first_with<T, F, Fut>(&self, options: PostOptions, body: F) -> Chain<T>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        Chain::new(self.core.clone(), options, body)
    }

    /// Build a sequencer that schedules onto this dispatcher.
    pub fn sequencer<K, S>(&self, config: SequencerConfiguration<S>) -> Sequencer<K, S>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        S: BuildHasher + Send + Sync + 'static,
    {
        Sequencer::new(self, config)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Wait until every live task finished (or `timeout` elapsed).
    ///
    /// Posting from outside the pools fails with `Draining` meanwhile; with
    /// `is_final` it stays disabled afterwards. Returns whether the
    /// dispatcher emptied.
    pub fn drain(&self, timeout: Option<Duration>, is_final: bool) -> bool {
        self.core.drain(timeout, is_final)
    }

    /// Stop the dispatcher. Idempotent.
    pub fn terminate(&self, mode: TerminateMode) {
        self.core.terminate(mode)
    }

    /// Whether `terminate` already ran
    pub fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Queued plus running tasks of one queue or a whole pool
    pub fn size(&self, kind: QueueType, queue: Option<usize>) -> Result<usize> {
        self.core.size(kind, queue)
    }

    /// No task is queued or running anywhere
    pub fn is_empty(&self) -> bool {
        self.core.size(QueueType::All, None).unwrap_or(0) == 0
    }

    /// Accepted tasks that have not finished yet, including suspended ones
    pub fn live_tasks(&self) -> usize {
        self.core.live_tasks()
    }

    /// Statistics of one queue, or the sum over a pool
    pub fn stats(&self, kind: QueueType, queue: Option<usize>) -> Result<QueueStatistics> {
        self.core.stats(kind, queue)
    }

    /// Zero the cumulative counters of every queue
    pub fn reset_stats(&self) {
        self.core.reset_stats()
    }

    /// Number of coroutine queues (and threads)
    pub fn coro_thread_count(&self) -> usize {
        self.core.coro_thread_count()
    }

    /// Number of IO queues (and threads)
    pub fn io_thread_count(&self) -> usize {
        self.core.io_thread_count()
    }

    /// Inclusive range of queues eligible for `QueueId::Any`
    pub fn coro_queue_range_for_any(&self) -> (usize, usize) {
        self.core.any_range()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.core.terminate(TerminateMode::Now);
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("coro_threads", &self.coro_thread_count())
            .field("io_threads", &self.io_thread_count())
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}
