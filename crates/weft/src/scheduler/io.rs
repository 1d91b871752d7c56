//! IO queue: blocking closures served by a dedicated worker thread.

use crate::error::{Error, Result};
use crate::scheduler::stats::QueueStats;
use crate::scheduler::{PoolKind, WorkerGuard};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use crossbeam::select;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Blocking work item; returns whether it succeeded.
pub(crate) type IoJob = Box<dyn FnOnce() -> bool + Send>;

/// How long an idle IO worker waits before re-checking for shutdown
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, Copy)]
struct Admission {
    closed: bool,
    discarded: bool,
}

/// One IO worker's queue. High-priority jobs travel on a separate channel
/// that the worker always drains first.
pub(crate) struct IoQueue {
    index: usize,
    normal_tx: Sender<IoJob>,
    normal_rx: Receiver<IoJob>,
    high_tx: Sender<IoJob>,
    high_rx: Receiver<IoJob>,
    /// Pushers hold it shared across the send, close takes it exclusively,
    /// so no job accepted before a discarding close survives it
    admission: RwLock<Admission>,
    stats: QueueStats,
}

impl IoQueue {
    pub(crate) fn new(index: usize) -> Arc<Self> {
        let (normal_tx, normal_rx) = channel::unbounded();
        let (high_tx, high_rx) = channel::unbounded();
        Arc::new(Self {
            index,
            normal_tx,
            normal_rx,
            high_tx,
            high_rx,
            admission: RwLock::new(Admission::default()),
            stats: QueueStats::default(),
        })
    }

    pub(crate) fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub(crate) fn push(&self, job: IoJob, high_priority: bool) -> Result<()> {
        let admission = self.admission.read();
        if admission.closed {
            return Err(Error::QueueClosed);
        }
        let tx = if high_priority {
            &self.high_tx
        } else {
            &self.normal_tx
        };
        // Counted before the send so the worker never dequeues it first
        self.stats.on_enqueue();
        if tx.send(job).is_err() {
            self.stats.on_dequeue();
            return Err(Error::QueueClosed);
        }
        drop(admission);
        Ok(())
    }

    fn len(&self) -> usize {
        self.normal_rx.len() + self.high_rx.len()
    }

    fn admission(&self) -> Admission {
        *self.admission.read()
    }

    /// Stop accepting jobs. With `discard` set, pending jobs are dropped
    /// (breaking their promises); otherwise the worker runs them first.
    pub(crate) fn close(&self, discard: bool) {
        {
            let mut admission = self.admission.write();
            admission.closed = true;
            admission.discarded |= discard;
        }
        if discard {
            self.discard_pending();
        }
    }

    fn discard_pending(&self) {
        let mut dropped = 0usize;
        for job in self.high_rx.try_iter().chain(self.normal_rx.try_iter()) {
            self.stats.on_dequeue();
            drop(job);
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!("io queue {}: discarded {} pending jobs", self.index, dropped);
        }
    }

    fn next_job(&self) -> Option<IoJob> {
        match self.high_rx.try_recv() {
            Ok(job) => return Some(job),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }
        select! {
            recv(self.high_rx) -> job => job.ok(),
            recv(self.normal_rx) -> job => job.ok(),
            default(IDLE_POLL) => None,
        }
    }

    /// Worker loop; runs until the queue is closed and empty.
    pub(crate) fn run(self: Arc<Self>, core_id: u64) {
        let _worker = WorkerGuard::enter(core_id, PoolKind::Io, self.index);
        log::debug!("io worker {} started", self.index);

        loop {
            let Some(job) = self.next_job() else {
                if self.admission().closed && self.len() == 0 {
                    break;
                }
                continue;
            };
            self.stats.on_dequeue();
            if self.admission().discarded {
                drop(job);
                continue;
            }
            self.stats.on_start();
            let ok = job();
            self.stats.on_stop();
            self.stats.on_finish(ok);
        }

        // Anything pushed in the window before close was observed
        self.discard_pending();
        log::debug!("io worker {} stopped", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_io_worker_runs_jobs() {
        let queue = IoQueue::new(0);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            queue
                .push(
                    Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        true
                    }),
                    false,
                )
                .unwrap();
        }
        queue.push(Box::new(|| false), false).unwrap();

        queue.close(false);
        queue.clone().run(1);

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        let stats = queue.stats().snapshot();
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.queued, 0);
    }

    #[test]
    fn test_high_priority_first() {
        let queue = IoQueue::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, high) in [("a", false), ("b", false), ("urgent", true)] {
            let order = order.clone();
            queue
                .push(
                    Box::new(move || {
                        order.lock().push(label);
                        true
                    }),
                    high,
                )
                .unwrap();
        }
        queue.close(false);
        queue.clone().run(1);
        assert_eq!(order.lock()[0], "urgent");
        assert_eq!(order.lock().len(), 3);
    }

    #[test]
    fn test_push_after_close_and_discard() {
        let queue = IoQueue::new(2);
        let ran = Arc::new(AtomicBool::new(false));
        assert!(!queue.admission().closed);
        let flag = ran.clone();
        queue
            .push(
                Box::new(move || {
                    flag.store(true, Ordering::SeqCst);
                    true
                }),
                false,
            )
            .unwrap();

        queue.close(true);
        assert!(matches!(
            queue.push(Box::new(|| true), false),
            Err(Error::QueueClosed)
        ));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.stats().snapshot().queued, 0);

        let worker = {
            let queue = queue.clone();
            thread::spawn(move || queue.run(1))
        };
        worker.join().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_push_and_discard() {
        // Jobs racing a discarding close either get rejected or are dropped
        // unrun; none may run after close returns
        for _ in 0..20 {
            let queue = IoQueue::new(0);
            let closed = Arc::new(AtomicBool::new(false));
            let late_runs = Arc::new(AtomicUsize::new(0));

            let pushers: Vec<_> = (0..4)
                .map(|_| {
                    let queue = queue.clone();
                    let closed = closed.clone();
                    let late_runs = late_runs.clone();
                    thread::spawn(move || {
                        for _ in 0..50 {
                            let closed = closed.clone();
                            let late_runs = late_runs.clone();
                            let job: IoJob = Box::new(move || {
                                if closed.load(Ordering::SeqCst) {
                                    late_runs.fetch_add(1, Ordering::SeqCst);
                                }
                                true
                            });
                            if queue.push(job, false).is_err() {
                                break;
                            }
                        }
                    })
                })
                .collect();

            queue.close(true);
            closed.store(true, Ordering::SeqCst);
            for pusher in pushers {
                pusher.join().unwrap();
            }
            queue.clone().run(1);

            assert_eq!(late_runs.load(Ordering::SeqCst), 0);
            assert_eq!(queue.len(), 0);
            assert_eq!(queue.stats().snapshot().queued, 0);
        }
    }
}
