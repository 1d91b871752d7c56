//! Per-queue counters

use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of one queue (or the sum over several)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    /// Tasks waiting on the ready list
    pub queued: usize,
    /// Tasks being executed right now
    pub running: usize,
    /// Coroutines suspended on a future, condition, timer or yield
    pub idle: usize,
    /// Tasks submitted since the last reset
    pub posted: usize,
    /// Tasks finished successfully since the last reset
    pub completed: usize,
    /// Tasks that failed or panicked since the last reset
    pub errors: usize,
    /// High-priority submissions since the last reset
    pub high_priority: usize,
}

impl QueueStatistics {
    /// Tasks that still need the worker (`queued + running`)
    pub fn load(&self) -> usize {
        self.queued + self.running
    }
}

impl AddAssign for QueueStatistics {
    fn add_assign(&mut self, other: Self) {
        self.queued += other.queued;
        self.running += other.running;
        self.idle += other.idle;
        self.posted += other.posted;
        self.completed += other.completed;
        self.errors += other.errors;
        self.high_priority += other.high_priority;
    }
}

/// Live counters behind a `QueueStatistics` snapshot
#[derive(Debug, Default)]
pub(crate) struct QueueStats {
    queued: CachePadded<AtomicUsize>,
    running: CachePadded<AtomicUsize>,
    idle: AtomicUsize,
    posted: AtomicUsize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    high_priority: AtomicUsize,
}

fn dec(counter: &AtomicUsize) {
    // Gauges never go below zero, even if a reset raced with a transition
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

impl QueueStats {
    pub(crate) fn on_post(&self, high_priority: bool) {
        self.posted.fetch_add(1, Ordering::Relaxed);
        if high_priority {
            self.high_priority.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn on_enqueue(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn on_dequeue(&self) {
        dec(&self.queued);
    }

    pub(crate) fn on_start(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn on_stop(&self) {
        dec(&self.running);
    }

    pub(crate) fn on_suspend(&self) {
        self.idle.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn on_resume(&self) {
        dec(&self.idle);
    }

    pub(crate) fn on_finish(&self, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `queued + running`, used for shortest-queue placement
    pub(crate) fn load(&self) -> usize {
        self.queued.load(Ordering::Acquire) + self.running.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> QueueStatistics {
        QueueStatistics {
            queued: self.queued.load(Ordering::Acquire),
            running: self.running.load(Ordering::Acquire),
            idle: self.idle.load(Ordering::Acquire),
            posted: self.posted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            high_priority: self.high_priority.load(Ordering::Relaxed),
        }
    }

    /// Zero the cumulative counters; gauges keep tracking live tasks.
    pub(crate) fn reset(&self) {
        self.posted.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.high_priority.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let stats = QueueStats::default();
        stats.on_post(true);
        stats.on_post(false);
        stats.on_enqueue();
        stats.on_enqueue();
        stats.on_dequeue();
        stats.on_start();
        stats.on_finish(true);
        stats.on_finish(false);

        let snap = stats.snapshot();
        assert_eq!(snap.posted, 2);
        assert_eq!(snap.high_priority, 1);
        assert_eq!(snap.queued, 1);
        assert_eq!(snap.running, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(stats.load(), 2);

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.posted, 0);
        assert_eq!(snap.completed, 0);
        assert_eq!(snap.queued, 1);
        assert_eq!(snap.running, 1);
    }

    #[test]
    fn test_gauges_saturate_at_zero() {
        let stats = QueueStats::default();
        stats.on_dequeue();
        stats.on_stop();
        stats.on_resume();
        assert_eq!(stats.snapshot(), QueueStatistics::default());
    }

    #[test]
    fn test_snapshot_sum() {
        let mut total = QueueStatistics::default();
        total += QueueStatistics {
            queued: 1,
            posted: 3,
            ..Default::default()
        };
        total += QueueStatistics {
            running: 2,
            posted: 4,
            ..Default::default()
        };
        assert_eq!(total.posted, 7);
        assert_eq!(total.load(), 3);
    }
}
