//! Coroutine task queue: one ready list plus one worker thread.

use crate::error::{Error, Result};
use crate::scheduler::hooks::{TaskEvent, TaskStateConfiguration, TaskType};
use crate::scheduler::stats::QueueStats;
use crate::scheduler::task::{Outcome, Task, TaskId};
use crate::scheduler::{PoolKind, WorkerGuard};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;

struct ReadyList {
    tasks: VecDeque<Arc<Task>>,
    /// Suspended tasks; the queue owns them until they are woken or cancelled
    parked: FxHashMap<TaskId, Arc<Task>>,
    closed: bool,
    discarded: bool,
}

/// Ready list served by exactly one worker thread.
///
/// Any thread may push; only the owning worker pops. A worker polls one
/// task at a time, so tasks on the same queue never run in parallel.
pub(crate) struct TaskQueue {
    index: usize,
    ready: Mutex<ReadyList>,
    available: Condvar,
    stats: QueueStats,
    hooks: TaskStateConfiguration,
}

impl TaskQueue {
    #[cfg(test)]
    pub(crate) fn new(index: usize) -> Arc<Self> {
        Self::with_hooks(index, TaskStateConfiguration::default())
    }

    pub(crate) fn with_hooks(index: usize, hooks: TaskStateConfiguration) -> Arc<Self> {
        Arc::new(Self {
            index,
            ready: Mutex::new(ReadyList {
                tasks: VecDeque::new(),
                parked: FxHashMap::default(),
                closed: false,
                discarded: false,
            }),
            available: Condvar::new(),
            stats: QueueStats::default(),
            hooks,
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub(crate) fn report(&self, id: TaskId, event: TaskEvent) {
        self.hooks.report(id, self.index, TaskType::Coroutine, event);
    }

    /// Append a task (front of the list when `front` is set).
    pub(crate) fn push(&self, task: Arc<Task>, front: bool) -> Result<()> {
        let mut ready = self.ready.lock();
        if ready.closed {
            return Err(Error::QueueClosed);
        }
        if front {
            ready.tasks.push_front(task);
        } else {
            ready.tasks.push_back(task);
        }
        self.stats.on_enqueue();
        drop(ready);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a task is ready; `None` once closed and empty.
    fn pop(&self) -> Option<Arc<Task>> {
        let mut ready = self.ready.lock();
        loop {
            if let Some(task) = ready.tasks.pop_front() {
                self.stats.on_dequeue();
                return Some(task);
            }
            if ready.closed {
                return None;
            }
            self.available.wait(&mut ready);
        }
    }

    /// Take ownership of a task that is about to suspend.
    ///
    /// Fails once the queue was closed with `discard`; the caller then
    /// cancels the task itself.
    pub(crate) fn park(&self, task: &Arc<Task>) -> bool {
        let mut ready = self.ready.lock();
        if ready.discarded {
            return false;
        }
        ready.parked.insert(task.id(), task.clone());
        true
    }

    /// Release a parked task (woken or cancelled).
    pub(crate) fn unpark(&self, id: TaskId) {
        let released = self.ready.lock().parked.remove(&id);
        drop(released);
    }

    /// Stop accepting tasks.
    ///
    /// With `discard` set, tasks still on the ready list and every suspended
    /// task are removed and returned so the caller can cancel them outside
    /// the lock; otherwise the worker finishes the ready list before exiting.
    pub(crate) fn close(&self, discard: bool) -> Vec<Arc<Task>> {
        let mut ready = self.ready.lock();
        ready.closed = true;
        let mut drained = Vec::new();
        if discard {
            ready.discarded = true;
            drained.extend(ready.tasks.drain(..));
            for _ in &drained {
                self.stats.on_dequeue();
            }
            drained.extend(ready.parked.drain().map(|(_, task)| task));
        }
        drop(ready);
        self.available.notify_all();
        drained
    }

    /// Worker loop; returns once the queue is closed and drained.
    pub(crate) fn run(self: Arc<Self>, core_id: u64) {
        let _worker = WorkerGuard::enter(core_id, PoolKind::Coro, self.index);
        log::debug!("coroutine worker {} started", self.index);

        while let Some(task) = self.pop() {
            self.stats.on_start();
            let finished = task.run();
            self.stats.on_stop();
            if let Some((outcome, frame)) = finished {
                self.stats.on_finish(outcome == Outcome::Completed);
                drop(frame);
            }
        }

        log::debug!("coroutine worker {} stopped", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, HeapAllocator};
    use crate::scheduler::task::TaskState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn counting_task(queue: &Arc<TaskQueue>, counter: Arc<AtomicUsize>) -> Arc<Task> {
        let task = Task::new(queue.clone(), false);
        task.install(
            Frame::new(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::Completed
                },
                Arc::new(HeapAllocator),
            )
            .unwrap(),
        );
        task
    }

    #[test]
    fn test_worker_runs_tasks() {
        let queue = TaskQueue::new(0);
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| counting_task(&queue, counter.clone()))
            .collect();
        for task in &tasks {
            task.schedule().unwrap();
        }

        let worker = {
            let queue = queue.clone();
            thread::spawn(move || queue.run(1))
        };

        let mut waited = 0;
        while counter.load(Ordering::SeqCst) < 10 && waited < 200 {
            thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(tasks.iter().all(|t| t.state() == TaskState::Done));

        queue.close(false);
        worker.join().unwrap();

        let stats = queue.stats().snapshot();
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.running, 0);
    }

    #[test]
    fn test_push_after_close() {
        let queue = TaskQueue::new(0);
        queue.close(false);
        let task = Task::new(queue.clone(), false);
        assert!(matches!(task.schedule(), Err(Error::QueueClosed)));
    }

    #[test]
    fn test_close_discards_and_cancels() {
        let queue = TaskQueue::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&queue, counter.clone());
        task.schedule().unwrap();
        assert_eq!(queue.stats().snapshot().queued, 1);

        let drained = queue.close(true);
        assert_eq!(drained.len(), 1);
        for task in drained {
            task.cancel();
        }
        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().snapshot().queued, 0);
    }

    struct DropFlag(Arc<AtomicUsize>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_suspended_task_owned_until_discard() {
        let queue = TaskQueue::new(0);
        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = DropFlag(dropped.clone());

        let task = Task::new(queue.clone(), false);
        task.install(
            Frame::new(
                async move {
                    let _flag = flag;
                    std::future::pending::<()>().await;
                    Outcome::Completed
                },
                Arc::new(HeapAllocator),
            )
            .unwrap(),
        );
        task.schedule().unwrap();
        let task_id = task.id();
        // Only the queue keeps the suspended task alive from here on
        drop(task);

        queue.close(false);
        queue.clone().run(1);
        assert_eq!(queue.stats().snapshot().idle, 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        let drained = queue.close(true);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id(), task_id);
        for task in drained {
            task.cancel();
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().snapshot().idle, 0);
    }

    #[test]
    fn test_lifecycle_events_reported() {
        use crate::scheduler::hooks::TaskEvent;
        use std::task::Poll;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let queue = TaskQueue::with_hooks(
            4,
            TaskStateConfiguration::new(move |_, queue, kind, event| {
                assert_eq!(queue, 4);
                assert_eq!(kind, TaskType::Coroutine);
                sink.lock().push(event);
            }),
        );

        let task = Task::new(queue.clone(), false);
        let mut yielded = false;
        task.install(
            Frame::new(
                std::future::poll_fn(move |cx| {
                    if yielded {
                        Poll::Ready(Outcome::Completed)
                    } else {
                        yielded = true;
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                }),
                Arc::new(HeapAllocator),
            )
            .unwrap(),
        );
        task.schedule().unwrap();

        let worker = {
            let queue = queue.clone();
            thread::spawn(move || queue.run(1))
        };
        let mut waited = 0;
        while task.state() != TaskState::Done && waited < 200 {
            thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        queue.close(false);
        worker.join().unwrap();

        assert_eq!(
            *events.lock(),
            vec![
                TaskEvent::Started,
                TaskEvent::Suspended,
                TaskEvent::Resumed,
                TaskEvent::Stopped
            ]
        );
    }

    #[test]
    fn test_high_priority_goes_first() {
        let queue = TaskQueue::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, high) in [("low", false), ("high", true)] {
            let order = order.clone();
            let task = Task::new(queue.clone(), high);
            task.install(
                Frame::new(
                    async move {
                        order.lock().push(label);
                        Outcome::Completed
                    },
                    Arc::new(HeapAllocator),
                )
                .unwrap(),
            );
            task.schedule().unwrap();
        }

        queue.close(false);
        queue.clone().run(1);
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }
}
