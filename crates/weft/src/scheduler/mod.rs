//! Task scheduler: coroutine and IO worker pools
//!
//! Two pool kinds do the work:
//! - coroutine queues: one ready list and one worker thread each; the worker
//!   polls one coroutine at a time and never blocks inside a task
//! - IO queues: one channel pair and one worker thread each; jobs may block
//!
//! A timer thread delivers deadline wakeups for sleeps and timed waits.

pub(crate) mod hooks;
pub(crate) mod io;
pub(crate) mod queue;
mod stats;
pub(crate) mod task;
pub(crate) mod timer;

pub use hooks::{TaskEvent, TaskStateConfiguration, TaskStateHandler, TaskType};
pub use stats::QueueStatistics;
pub use task::{SuspendReason, TaskId, TaskState};

pub(crate) use stats::QueueStats;

use crate::error::{Error, Result};
use std::cell::Cell;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Target queue of a submission
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum QueueId {
    /// Let the load-balancing policy pick a queue
    #[default]
    Any,
    /// The caller's own coroutine queue (`Any` when called from a plain thread)
    Same,
    /// A specific queue index
    Id(usize),
}

impl From<usize> for QueueId {
    fn from(index: usize) -> Self {
        QueueId::Id(index)
    }
}

/// Which pool a worker belongs to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PoolKind {
    Coro,
    Io,
}

/// Identity of the worker running on the current thread
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct WorkerSlot {
    pub(crate) core_id: u64,
    pub(crate) kind: PoolKind,
    pub(crate) index: usize,
}

thread_local! {
    static CURRENT: Cell<Option<WorkerSlot>> = const { Cell::new(None) };
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// Marks `id` as the task running on this thread until dropped.
pub(crate) struct CurrentTaskGuard {
    previous: Option<TaskId>,
}

impl CurrentTaskGuard {
    pub(crate) fn enter(id: TaskId) -> Self {
        Self {
            previous: CURRENT_TASK.with(|c| c.replace(Some(id))),
        }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|c| c.set(self.previous));
    }
}

/// Id of the coroutine or IO job executing on the calling thread.
///
/// `None` outside of tasks. Usable from helper code that has no
/// [`Context`](crate::Context) at hand.
pub fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK.with(|c| c.get())
}

/// Marks the current thread as a worker for its lifetime.
pub(crate) struct WorkerGuard {
    previous: Option<WorkerSlot>,
}

impl WorkerGuard {
    pub(crate) fn enter(core_id: u64, kind: PoolKind, index: usize) -> Self {
        let previous = CURRENT.with(|c| {
            c.replace(Some(WorkerSlot {
                core_id,
                kind,
                index,
            }))
        });
        Self { previous }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

/// Worker identity of the calling thread, if it is one
pub(crate) fn current_worker() -> Option<WorkerSlot> {
    CURRENT.with(|c| c.get())
}

/// Blocking waits are forbidden on coroutine workers: they would stall
/// every other coroutine of that queue.
pub(crate) fn ensure_blocking_allowed() -> Result<()> {
    match current_worker() {
        Some(WorkerSlot {
            kind: PoolKind::Coro,
            ..
        }) => Err(Error::WrongContext),
        _ => Ok(()),
    }
}

/// Whether the calling thread is a coroutine worker
pub fn is_coroutine_thread() -> bool {
    matches!(
        current_worker(),
        Some(WorkerSlot {
            kind: PoolKind::Coro,
            ..
        })
    )
}

/// Join a worker, giving up after `timeout` (the thread is then detached).
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        if start.elapsed() > timeout {
            log::warn!(
                "worker {:?} did not stop within {:?}, detaching",
                handle.thread().name(),
                timeout
            );
            drop(handle);
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_allowed_outside_workers() {
        assert!(ensure_blocking_allowed().is_ok());
        assert!(!is_coroutine_thread());
    }

    #[test]
    fn test_worker_guard_scopes_identity() {
        {
            let _guard = WorkerGuard::enter(9, PoolKind::Coro, 2);
            assert!(matches!(ensure_blocking_allowed(), Err(Error::WrongContext)));
            assert_eq!(current_worker().map(|w| w.index), Some(2));

            {
                let _inner = WorkerGuard::enter(9, PoolKind::Io, 0);
                assert!(ensure_blocking_allowed().is_ok());
            }
            assert!(is_coroutine_thread());
        }
        assert!(current_worker().is_none());
    }

    #[test]
    fn test_current_task_guard_nests() {
        assert!(current_task_id().is_none());
        let outer = TaskId::new();
        let inner = TaskId::new();
        {
            let _outer = CurrentTaskGuard::enter(outer);
            {
                let _inner = CurrentTaskGuard::enter(inner);
                assert_eq!(current_task_id(), Some(inner));
            }
            assert_eq!(current_task_id(), Some(outer));
        }
        assert!(current_task_id().is_none());
    }

    #[test]
    fn test_join_with_timeout_finished_thread() {
        let handle = thread::spawn(|| {});
        join_with_timeout(handle, Duration::from_secs(1));
    }
}
