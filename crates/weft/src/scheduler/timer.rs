//! Timer thread for sleeps and timed waits
//!
//! Coroutines never block a worker to wait for a deadline. They register
//! their waker here and suspend; the timer thread sleeps on a condvar until
//! the earliest deadline and wakes whatever is due. A wait that finishes
//! early removes its entry, so long timeouts do not pile up.

use crate::error::Result;
use crate::scheduler::join_with_timeout;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::task::Waker;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Handle to one registered deadline.
///
/// Ordered by deadline, then by registration order so equal deadlines fire
/// FIFO.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    wake_at: Instant,
    seq: u64,
}

struct TimerState {
    pending: BTreeMap<TimerKey, Waker>,
    next_seq: u64,
    shutdown: bool,
}

/// Deadline wakeup service shared by every coroutine of a dispatcher
pub(crate) struct TimerThread {
    state: Mutex<TimerState>,
    notify: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TimerState {
                pending: BTreeMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            notify: Condvar::new(),
            handle: Mutex::new(None),
        })
    }

    pub(crate) fn start(self: &Arc<Self>, name: String) -> Result<()> {
        let timer = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || timer.run_loop())?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the thread and wake everything still registered.
    pub(crate) fn stop(&self) {
        let leftover = {
            // Flag and notify under the lock: the thread checks the flag
            // under the same lock right before it waits
            let mut state = self.state.lock();
            state.shutdown = true;
            self.notify.notify_one();
            mem::take(&mut state.pending)
        };
        for waker in leftover.into_values() {
            waker.wake();
        }

        if let Some(handle) = self.handle.lock().take() {
            join_with_timeout(handle, Duration::from_secs(2));
        }
    }

    /// Wake `waker` at `wake_at`. After shutdown the waker fires immediately
    /// and no key is returned.
    pub(crate) fn register(&self, wake_at: Instant, waker: Waker) -> Option<TimerKey> {
        let mut state = self.state.lock();
        if state.shutdown {
            drop(state);
            waker.wake();
            return None;
        }
        let key = TimerKey {
            wake_at,
            seq: state.next_seq,
        };
        state.next_seq += 1;
        let earliest = state.pending.keys().next().is_none_or(|first| key < *first);
        state.pending.insert(key, waker);
        if earliest {
            self.notify.notify_one();
        }
        Some(key)
    }

    /// Drop a deadline that is no longer needed (no-op if it already fired).
    pub(crate) fn cancel(&self, key: TimerKey) {
        let removed = self.state.lock().pending.remove(&key);
        drop(removed);
    }

    /// Number of registered deadlines
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn run_loop(&self) {
        log::debug!("timer thread started");
        let mut due = Vec::new();

        let mut state = self.state.lock();
        while !state.shutdown {
            let now = Instant::now();
            while let Some(entry) = state.pending.first_entry() {
                if entry.key().wake_at > now {
                    break;
                }
                due.push(entry.remove());
            }

            if due.is_empty() {
                match state.pending.keys().next() {
                    Some(next) => {
                        let deadline = next.wake_at;
                        self.notify.wait_until(&mut state, deadline);
                    }
                    None => self.notify.wait(&mut state),
                }
                continue;
            }

            // Wake outside the lock: a woken task may register again
            drop(state);
            for waker in due.drain(..) {
                waker.wake();
            }
            state = self.state.lock();
        }
        drop(state);

        log::debug!("timer thread stopped");
    }
}
