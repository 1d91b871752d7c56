//! Sequencer statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of one sequence key (or of the universal key, or of all tasks)
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SequenceKeyStatistics {
    /// Tasks submitted
    pub posted: u64,
    /// Submitted tasks that have not finished
    pub pending: u64,
    /// Sum of the time tasks spent waiting for their predecessors
    pub total_wait: Duration,
    /// Longest single admission wait
    pub max_wait: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct StatsWriter {
    posted: AtomicU64,
    pending: AtomicU64,
    total_wait_ns: AtomicU64,
    max_wait_ns: AtomicU64,
}

impl StatsWriter {
    pub(crate) fn on_post(&self) {
        self.posted.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_admit(&self, wait: Duration) {
        let nanos = u64::try_from(wait.as_nanos()).unwrap_or(u64::MAX);
        self.total_wait_ns.fetch_add(nanos, Ordering::Relaxed);
        self.max_wait_ns.fetch_max(nanos, Ordering::Relaxed);
    }

    pub(crate) fn on_finish(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub(crate) fn snapshot(&self) -> SequenceKeyStatistics {
        SequenceKeyStatistics {
            posted: self.posted.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            total_wait: Duration::from_nanos(self.total_wait_ns.load(Ordering::Relaxed)),
            max_wait: Duration::from_nanos(self.max_wait_ns.load(Ordering::Relaxed)),
        }
    }
}
