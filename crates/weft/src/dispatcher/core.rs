//! Dispatcher core: pools, placement, task construction and lifecycle.

use crate::config::{Configuration, LoadBalancePolicy};
use crate::context::{Context, StopToken};
use crate::dispatcher::{PostOptions, QueueType, TerminateMode};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameAllocator};
use crate::promise::{self, Future};
use crate::scheduler::io::{IoJob, IoQueue};
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::hooks::{TaskEvent, TaskStateConfiguration, TaskType};
use crate::scheduler::task::{Guarded, Outcome, Task, TaskId};
use crate::scheduler::timer::TimerThread;
use crate::scheduler::{
    current_worker, join_with_timeout, CurrentTaskGuard, PoolKind, QueueId, QueueStatistics,
    QueueStats,
};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::future::Future as StdFuture;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

static NEXT_CORE_ID: AtomicU64 = AtomicU64::new(1);

/// How long terminate waits for each worker thread
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Live task accounting
// ============================================================================

/// Counts tasks that were accepted and have not released their frame yet
pub(crate) struct LiveTasks {
    count: Mutex<usize>,
    idle: Condvar,
}

impl LiveTasks {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    fn enter(self: &Arc<Self>) -> LiveGuard {
        *self.count.lock() += 1;
        LiveGuard(self.clone())
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until no task is live; false if `deadline` passed first.
    fn wait_idle(&self, deadline: Option<Instant>) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut count, deadline).timed_out() {
                        return *count == 0;
                    }
                }
                None => self.idle.wait(&mut count),
            }
        }
        true
    }
}

/// Held by a task's frame (or IO job) for its whole life
pub(crate) struct LiveGuard(Arc<LiveTasks>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

// ============================================================================
// Core
// ============================================================================

/// State shared by the dispatcher, its contexts and its sequencers
pub(crate) struct Core {
    id: u64,
    coro: Vec<Arc<TaskQueue>>,
    io: Vec<Arc<IoQueue>>,
    timer: Arc<TimerThread>,
    allocator: Arc<dyn FrameAllocator>,
    load_balance: LoadBalancePolicy,
    any_range: (usize, usize),
    next_coro: AtomicUsize,
    next_io: AtomicUsize,
    live: Arc<LiveTasks>,
    draining: AtomicBool,
    terminated: AtomicBool,
    stop: StopToken,
    hooks: TaskStateConfiguration,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Build the pools and start every worker thread.
    pub(crate) fn start(
        config: &Configuration,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Arc<Self>> {
        let coro_threads = config.resolved_coro_threads();
        let io_threads = config.resolved_io_threads();

        let core = Arc::new(Self {
            id: NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed),
            coro: (0..coro_threads)
                .map(|index| TaskQueue::with_hooks(index, config.task_state.clone()))
                .collect(),
            io: (0..io_threads).map(IoQueue::new).collect(),
            timer: TimerThread::new(),
            allocator,
            load_balance: config.load_balance,
            any_range: config.resolved_any_range(),
            next_coro: AtomicUsize::new(0),
            next_io: AtomicUsize::new(0),
            live: LiveTasks::new(),
            draining: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            stop: StopToken::new(),
            hooks: config.task_state.clone(),
            threads: Mutex::new(Vec::with_capacity(coro_threads + io_threads)),
        });

        if let Err(error) = core.spawn_workers(&config.thread_name_prefix) {
            core.terminate(TerminateMode::Now);
            return Err(error);
        }

        log::debug!(
            "dispatcher {} started: {} coroutine queues, {} io queues, any range {:?}",
            core.id,
            coro_threads,
            io_threads,
            core.any_range
        );
        Ok(core)
    }

    fn spawn_workers(&self, prefix: &str) -> Result<()> {
        self.timer.start(format!("{}-timer", prefix))?;

        for queue in &self.coro {
            let queue = queue.clone();
            let core_id = self.id;
            let handle = thread::Builder::new()
                .name(format!("{}-coro-{}", prefix, queue.index()))
                .spawn(move || queue.run(core_id))?;
            self.threads.lock().push(handle);
        }

        for (i, queue) in self.io.iter().enumerate() {
            let queue = queue.clone();
            let core_id = self.id;
            let handle = thread::Builder::new()
                .name(format!("{}-io-{}", prefix, i))
                .spawn(move || queue.run(core_id))?;
            self.threads.lock().push(handle);
        }

        Ok(())
    }

    pub(crate) fn coro_thread_count(&self) -> usize {
        self.coro.len()
    }

    pub(crate) fn io_thread_count(&self) -> usize {
        self.io.len()
    }

    pub(crate) fn any_range(&self) -> (usize, usize) {
        self.any_range
    }

    pub(crate) fn timer(&self) -> &Arc<TimerThread> {
        &self.timer
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.stop_requested()
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.live.count()
    }

    /// Whether the calling thread is one of this dispatcher's workers
    pub(crate) fn on_worker_thread(&self) -> bool {
        current_worker().is_some_and(|w| w.core_id == self.id)
    }

    fn current_coro_queue(&self) -> Option<usize> {
        current_worker()
            .filter(|w| w.core_id == self.id && w.kind == PoolKind::Coro)
            .map(|w| w.index)
    }

    /// Reject submissions after terminate, and from outside the pools while draining.
    pub(crate) fn check_posting(&self) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::QueueClosed);
        }
        if self.draining.load(Ordering::Acquire) && !self.on_worker_thread() {
            return Err(Error::Draining);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------------

    fn select_coro_queue(&self, id: QueueId) -> Result<usize> {
        match id {
            QueueId::Id(index) if index < self.coro.len() => Ok(index),
            QueueId::Id(index) => Err(Error::InvalidQueue(index)),
            QueueId::Same => match self.current_coro_queue() {
                Some(index) => Ok(index),
                None => Ok(self.pick_any()),
            },
            QueueId::Any => Ok(self.pick_any()),
        }
    }

    fn pick_any(&self) -> usize {
        let (first, last) = self.any_range;
        let span = last - first + 1;
        match self.load_balance {
            LoadBalancePolicy::RoundRobin => {
                first + self.next_coro.fetch_add(1, Ordering::Relaxed) % span
            }
            LoadBalancePolicy::ShortestQueue => {
                // Random starting point so ties spread over the range
                let offset = rand::thread_rng().gen_range(0..span);
                let mut best = first + offset;
                let mut best_load = usize::MAX;
                for step in 0..span {
                    let index = first + (offset + step) % span;
                    let load = self.coro[index].stats().load();
                    if load < best_load {
                        best = index;
                        best_load = load;
                        if load == 0 {
                            break;
                        }
                    }
                }
                best
            }
        }
    }

    fn select_io_queue(&self, id: QueueId) -> Result<usize> {
        match id {
            QueueId::Id(index) if index < self.io.len() => Ok(index),
            QueueId::Id(index) => Err(Error::InvalidQueue(index)),
            QueueId::Any | QueueId::Same => {
                Ok(self.next_io.fetch_add(1, Ordering::Relaxed) % self.io.len())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Task construction
    // ------------------------------------------------------------------------

    /// Build a coroutine task without scheduling it.
    pub(crate) fn prepare<T, F, Fut>(
        self: &Arc<Self>,
        options: &PostOptions,
        body: F,
    ) -> Result<(Arc<Task>, Future<T>)>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        let index = self.select_coro_queue(options.queue)?;
        let queue = &self.coro[index];
        let task = Task::new(queue.clone(), options.high_priority);
        let ctx = Context::new(
            index,
            Arc::downgrade(&task),
            self.clone(),
            options.stop_token.clone(),
        );

        let (promise, future) = promise::channel();
        let live = self.live.enter();
        let task_id = task.id().as_u64();
        let frame = Frame::new(
            async move {
                let _live = live;
                let result = Guarded::new(async move { body(ctx).await }).await;
                let outcome = match &result {
                    Ok(_) => Outcome::Completed,
                    Err(error) => {
                        log::trace!("task {} failed: {}", task_id, error);
                        Outcome::Failed
                    }
                };
                let _ = promise.set_result(result);
                outcome
            },
            self.allocator.clone(),
        )?;
        task.install(frame);
        queue.stats().on_post(options.high_priority);
        log::trace!("task {} posted to queue {}", task_id, index);
        Ok((task, future))
    }

    /// Put a prepared task on its ready list; cancels it on failure.
    pub(crate) fn schedule(&self, task: &Arc<Task>) -> Result<()> {
        task.schedule().inspect_err(|_| task.cancel())
    }

    pub(crate) fn post<T, F, Fut>(self: &Arc<Self>, options: PostOptions, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.check_posting()?;
        let (task, future) = self.prepare(&options, body)?;
        self.schedule(&task)?;
        Ok(future)
    }

    pub(crate) fn post_io<T, F>(&self, options: PostOptions, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.check_posting()?;
        let index = self.select_io_queue(options.queue)?;
        let queue = &self.io[index];

        let (promise, future) = promise::channel();
        let live = self.live.enter();
        let hooks = self.hooks.clone();
        let job: IoJob = Box::new(move || {
            let _live = live;
            let id = TaskId::new();
            let _current = CurrentTaskGuard::enter(id);
            hooks.report(id, index, TaskType::Io, TaskEvent::Started);
            let result = catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
                let error = Error::from_panic(payload);
                log::warn!("io {}", error);
                Err(error)
            });
            let ok = result.is_ok();
            hooks.report(id, index, TaskType::Io, TaskEvent::Stopped);
            let _ = promise.set_result(result);
            ok
        });

        queue.stats().on_post(options.high_priority);
        queue.push(job, options.high_priority)?;
        Ok(future)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub(crate) fn drain(&self, timeout: Option<Duration>, is_final: bool) -> bool {
        if self.on_worker_thread() {
            log::warn!("drain called from a worker of the same dispatcher; ignored");
            return false;
        }
        self.draining.store(true, Ordering::Release);
        let drained = self.live.wait_idle(timeout.map(|t| Instant::now() + t));
        if !is_final {
            self.draining.store(false, Ordering::Release);
        }
        log::debug!("dispatcher {} drain finished (empty: {})", self.id, drained);
        drained
    }

    pub(crate) fn terminate(&self, mode: TerminateMode) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if mode == TerminateMode::Drain {
            self.draining.store(true, Ordering::Release);
            if !self.on_worker_thread() {
                self.live.wait_idle(None);
            }
        }
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.request_stop();

        let discard = mode == TerminateMode::Now;
        for queue in &self.coro {
            for task in queue.close(discard) {
                task.cancel();
            }
        }
        for queue in &self.io {
            queue.close(discard);
        }
        // Sleepers are woken into closed queues and cancelled
        self.timer.stop();

        let handles = mem::take(&mut *self.threads.lock());
        for handle in handles {
            join_with_timeout(handle, JOIN_TIMEOUT);
        }
        log::debug!("dispatcher {} terminated ({:?})", self.id, mode);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    fn with_stats<R>(
        &self,
        kind: QueueType,
        queue: Option<usize>,
        mut each: impl FnMut(&QueueStats) -> R,
    ) -> Result<Vec<R>> {
        let coro = self.coro.iter().map(|q| q.stats());
        let io = self.io.iter().map(|q| q.stats());
        match (kind, queue) {
            (QueueType::Coro, Some(index)) => self
                .coro
                .get(index)
                .map(|q| vec![each(q.stats())])
                .ok_or(Error::InvalidQueue(index)),
            (QueueType::Io, Some(index)) => self
                .io
                .get(index)
                .map(|q| vec![each(q.stats())])
                .ok_or(Error::InvalidQueue(index)),
            (QueueType::All, Some(index)) => Err(Error::InvalidQueue(index)),
            (QueueType::Coro, None) => Ok(coro.map(each).collect()),
            (QueueType::Io, None) => Ok(io.map(each).collect()),
            (QueueType::All, None) => Ok(coro.chain(io).map(each).collect()),
        }
    }

    pub(crate) fn stats(&self, kind: QueueType, queue: Option<usize>) -> Result<QueueStatistics> {
        let mut total = QueueStatistics::default();
        for snapshot in self.with_stats(kind, queue, |s| s.snapshot())? {
            total += snapshot;
        }
        Ok(total)
    }

    pub(crate) fn size(&self, kind: QueueType, queue: Option<usize>) -> Result<usize> {
        Ok(self.with_stats(kind, queue, |s| s.load())?.into_iter().sum())
    }

    pub(crate) fn reset_stats(&self) {
        for queue in &self.coro {
            queue.stats().reset();
        }
        for queue in &self.io {
            queue.stats().reset();
        }
    }
}
