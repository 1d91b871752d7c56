//! Coroutine task structure and scheduling state

use crate::error::Error;
use crate::frame::Frame;
use crate::scheduler::hooks::TaskEvent;
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::CurrentTaskGuard;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::future::Future;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake};
use std::time::Instant;

/// Unique identifier for a task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling state of a task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Built but never scheduled (e.g. held back by a sequencer gate)
    Created,
    /// On a ready list
    Queued,
    /// Being polled by its worker
    Running,
    /// Woken while being polled; goes back on the ready list after the poll
    Notified,
    /// Suspended until something wakes it
    Suspended,
    /// Completed, failed or cancelled
    Done,
}

impl TaskState {
    const fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Created,
            1 => TaskState::Queued,
            2 => TaskState::Running,
            3 => TaskState::Notified,
            4 => TaskState::Suspended,
            _ => TaskState::Done,
        }
    }
}

/// Why a coroutine is suspended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// Gave up the worker voluntarily
    Yield,
    /// Waiting for a future, shared future or buffer
    Future,
    /// Waiting on a condition variable
    Condition,
    /// Sleeping until a deadline
    Sleep {
        /// When to wake up
        wake_at: Instant,
    },
    /// Re-acquiring a mutex after a condition wait or unlock
    Relock,
}

/// Result of one poll as seen by the worker
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed,
}

/// Schedulable coroutine.
///
/// The task is its own waker: waking it puts it back on the ready list of the
/// queue it was created on.
pub(crate) struct Task {
    id: TaskId,
    state: AtomicU8,
    high_priority: bool,
    queue: Arc<TaskQueue>,
    frame: Mutex<Option<Frame<Outcome>>>,
    suspend_reason: Mutex<Option<SuspendReason>>,
    started: AtomicBool,
    locals: Mutex<FxHashMap<String, Box<dyn Any + Send>>>,
}

impl Task {
    /// Create an unscheduled task bound to `queue`. The frame is installed
    /// separately because the body needs a weak handle to the task first.
    pub(crate) fn new(queue: Arc<TaskQueue>, high_priority: bool) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::new(),
            state: AtomicU8::new(TaskState::Created.to_u8()),
            high_priority,
            queue,
            frame: Mutex::new(None),
            suspend_reason: Mutex::new(None),
            started: AtomicBool::new(false),
            locals: Mutex::new(FxHashMap::default()),
        })
    }

    pub(crate) fn install(&self, frame: Frame<Outcome>) {
        *self.frame.lock() = Some(frame);
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_suspend_reason(&self, reason: SuspendReason) {
        *self.suspend_reason.lock() = Some(reason);
    }

    pub(crate) fn clear_suspend_reason(&self) {
        *self.suspend_reason.lock() = None;
    }

    pub(crate) fn suspend_reason(&self) -> Option<SuspendReason> {
        self.suspend_reason.lock().clone()
    }

    /// Run `f` on the task-local slot `key`.
    ///
    /// The slot is empty when unset or when it holds a value of another
    /// type; whatever `f` leaves in it is stored back, and a value of
    /// another type is only replaced when `f` stores one. No lock is held
    /// while `f` runs.
    pub(crate) fn with_local<T, R>(&self, key: &str, f: impl FnOnce(&mut Option<T>) -> R) -> R
    where
        T: Send + 'static,
    {
        let stored = self.locals.lock().remove(key);
        let (mut slot, other) = match stored.map(|value| value.downcast::<T>()) {
            Some(Ok(value)) => (Some(*value), None),
            Some(Err(other)) => (None, Some(other)),
            None => (None, None),
        };
        let result = f(&mut slot);
        // A value of another type survives unless `f` replaced it
        let keep = match slot {
            Some(value) => Some(Box::new(value) as Box<dyn Any + Send>),
            None => other,
        };
        if let Some(value) = keep {
            self.locals.lock().insert(key.to_owned(), value);
        }
        result
    }

    fn release_locals(&self) {
        let locals = mem::take(&mut *self.locals.lock());
        drop(locals);
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Put a freshly built task on its ready list for the first time.
    pub(crate) fn schedule(self: &Arc<Self>) -> crate::Result<()> {
        if !self.transition(TaskState::Created, TaskState::Queued) {
            return Ok(());
        }
        self.queue.push(self.clone(), self.high_priority)
    }

    /// Wake path shared by every waker clone.
    fn notify(self: &Arc<Self>) {
        loop {
            match self.state() {
                TaskState::Suspended => {
                    if self.transition(TaskState::Suspended, TaskState::Queued) {
                        self.queue.stats().on_resume();
                        self.queue.unpark(self.id);
                        self.clear_suspend_reason();
                        if self.queue.push(self.clone(), self.high_priority).is_err() {
                            self.cancel();
                        }
                        return;
                    }
                }
                TaskState::Running => {
                    if self.transition(TaskState::Running, TaskState::Notified) {
                        return;
                    }
                }
                // Created tasks are scheduled explicitly; the rest are
                // already queued, already notified or finished.
                _ => return,
            }
        }
    }

    /// Poll once on the current worker.
    ///
    /// Returns the outcome and the spent frame when the task finished; the
    /// caller drops the frame after its bookkeeping, which releases the live
    /// count. When the task was woken during the poll it is pushed back at
    /// the tail of its queue.
    pub(crate) fn run(self: &Arc<Self>) -> Option<(Outcome, Frame<Outcome>)> {
        if !self.transition(TaskState::Queued, TaskState::Running) {
            return None;
        }

        let Some(mut frame) = self.frame.lock().take() else {
            self.state.store(TaskState::Done.to_u8(), Ordering::Release);
            return None;
        };

        let _current = CurrentTaskGuard::enter(self.id);
        let event = if self.started.swap(true, Ordering::AcqRel) {
            TaskEvent::Resumed
        } else {
            TaskEvent::Started
        };
        self.queue.report(self.id, event);

        let waker = std::task::Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        match frame.poll(&mut cx) {
            Poll::Ready(outcome) => {
                let previous = self.state.swap(TaskState::Done.to_u8(), Ordering::AcqRel);
                if TaskState::from_u8(previous) != TaskState::Done {
                    self.queue.report(self.id, TaskEvent::Stopped);
                }
                self.release_locals();
                log::trace!("task {} finished: {:?}", self.id.as_u64(), outcome);
                Some((outcome, frame))
            }
            Poll::Pending => {
                *self.frame.lock() = Some(frame);
                self.queue.report(self.id, TaskEvent::Suspended);
                // Parked before the state flips so a concurrent wake always
                // finds the entry it has to release
                if !self.queue.park(self) {
                    self.cancel();
                    return None;
                }
                // Counted first: a wake may resume the task right after the flip
                self.queue.stats().on_suspend();
                if self.transition(TaskState::Running, TaskState::Suspended) {
                    log::trace!(
                        "task {} suspended: {:?}",
                        self.id.as_u64(),
                        self.suspend_reason()
                    );
                    return None;
                }
                self.queue.stats().on_resume();
                self.queue.unpark(self.id);
                if self.transition(TaskState::Notified, TaskState::Queued) {
                    // Woken mid-poll (yield or a fast completion): back to the tail
                    self.clear_suspend_reason();
                    if self.queue.push(self.clone(), false).is_err() {
                        self.cancel();
                    }
                }
                None
            }
        }
    }

    /// Drop the frame without running it to completion.
    ///
    /// Everything the body captured is released, so its promise breaks and
    /// waiters observe `BrokenPromise`.
    pub(crate) fn cancel(&self) {
        let previous = TaskState::from_u8(self.state.swap(TaskState::Done.to_u8(), Ordering::AcqRel));
        if previous == TaskState::Suspended {
            self.queue.stats().on_resume();
        }
        self.queue.unpark(self.id);
        if previous != TaskState::Done && self.started.load(Ordering::Acquire) {
            self.queue.report(self.id, TaskEvent::Stopped);
        }
        self.release_locals();
        let frame = self.frame.lock().take();
        if frame.is_some() {
            log::warn!("task {} cancelled", self.id.as_u64());
        }
        drop(frame);
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.notify();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notify();
    }
}

// ============================================================================
// Panic isolation
// ============================================================================

/// Converts a panic inside the wrapped future into `Error::Panicked`.
pub(crate) struct Guarded<F> {
    inner: F,
    poisoned: bool,
}

impl<F> Guarded<F> {
    pub(crate) fn new(inner: F) -> Self {
        Self {
            inner,
            poisoned: false,
        }
    }
}

impl<T, F> Future for Guarded<F>
where
    F: Future<Output = crate::Result<T>>,
{
    type Output = crate::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `inner` is structurally pinned and never moved out
        let this = unsafe { self.get_unchecked_mut() };
        if this.poisoned {
            return Poll::Ready(Err(Error::Panicked("polled after panic".into())));
        }
        let inner = unsafe { Pin::new_unchecked(&mut this.inner) };
        match catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(poll) => poll,
            Err(payload) => {
                this.poisoned = true;
                let error = Error::from_panic(payload);
                log::warn!("{}", error);
                Poll::Ready(Err(error))
            }
        }
    }
}
