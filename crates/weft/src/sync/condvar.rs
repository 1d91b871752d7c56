//! Condition variable usable from threads and coroutines alike
//!
//! Waiters are kept in FIFO order. A thread waiter parks on its own condvar;
//! a coroutine waiter registers its task waker and suspends, so the worker
//! keeps running other tasks. Either kind is registered while the caller
//! still holds the associated mutex, so a notification issued after the
//! caller checked its predicate cannot be missed.

use super::guard::relock;
use crate::context::Context;
use crate::error::Result;
use crate::promise::FutureStatus;
use crate::scheduler::{ensure_blocking_allowed, SuspendReason};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Poll, Waker};
use std::time::{Duration, Instant};

#[derive(Default)]
struct WaiterState {
    notified: bool,
    waker: Option<Waker>,
}

#[derive(Default)]
struct Waiter {
    state: Mutex<WaiterState>,
    parked: Condvar,
}

impl Waiter {
    fn notify(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.notified = true;
            state.waker.take()
        };
        self.parked.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn is_notified(&self) -> bool {
        self.state.lock().notified
    }

    /// Park the thread; false if `deadline` passed first.
    fn block(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while !state.notified {
            match deadline {
                Some(deadline) => {
                    if self.parked.wait_until(&mut state, deadline).timed_out() {
                        return state.notified;
                    }
                }
                None => self.parked.wait(&mut state),
            }
        }
        true
    }
}

/// Condition variable paired with a `parking_lot::Mutex`
#[derive(Default)]
pub struct ConditionVariable {
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

impl ConditionVariable {
    /// Create a condition variable with no waiters
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter::default());
        self.waiters.lock().push_back(waiter.clone());
        waiter
    }

    /// Unregister `waiter`; false if a notifier already took it.
    fn remove(&self, waiter: &Arc<Waiter>) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(index) => {
                waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of registered waiters
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    // ------------------------------------------------------------------------
    // Notification
    // ------------------------------------------------------------------------

    /// Wake the oldest waiter, if any
    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().pop_front();
        if let Some(waiter) = waiter {
            waiter.notify();
        }
    }

    /// Wake every current waiter
    pub fn notify_all(&self) {
        let waiters = mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter.notify();
        }
    }

    // ------------------------------------------------------------------------
    // Thread waits
    // ------------------------------------------------------------------------

    /// Release the lock, block until notified, reacquire.
    ///
    /// Fails with `WrongContext` on a coroutine worker thread.
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) -> Result<()> {
        ensure_blocking_allowed()?;
        let waiter = self.enqueue();
        MutexGuard::unlocked(guard, || waiter.block(None));
        Ok(())
    }

    /// [`ConditionVariable::wait`] bounded by `timeout`.
    pub fn wait_for<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> Result<FutureStatus> {
        ensure_blocking_allowed()?;
        let waiter = self.enqueue();
        let deadline = Instant::now() + timeout;
        let notified = MutexGuard::unlocked(guard, || waiter.block(Some(deadline)));
        // A notifier that already popped us counts as a delivered notification
        if notified || !self.remove(&waiter) {
            Ok(FutureStatus::Ready)
        } else {
            Ok(FutureStatus::Timeout)
        }
    }

    /// Block while `condition` holds.
    pub fn wait_while<T, P>(&self, guard: &mut MutexGuard<'_, T>, mut condition: P) -> Result<()>
    where
        P: FnMut(&mut T) -> bool,
    {
        while condition(&mut **guard) {
            self.wait(guard)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Coroutine waits
    // ------------------------------------------------------------------------

    /// Release `guard`, suspend until notified, then reacquire `mutex`.
    ///
    /// The guard is consumed before the returned future is created; the new
    /// guard is produced on resumption.
    pub fn wait_async<'a, T>(
        &'a self,
        ctx: &'a Context,
        mutex: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
    ) -> impl Future<Output = MutexGuard<'a, T>> + Send + 'a
    where
        T: Send,
    {
        let notified = Notified {
            cv: self,
            waiter: self.enqueue(),
        };
        drop(guard);
        async move {
            ctx.suspend(SuspendReason::Condition, notified).await;
            relock(ctx, mutex).await
        }
    }

    /// Suspend until `condition` no longer holds; returns the guard under
    /// which it was observed false.
    pub fn wait_while_async<'a, T, P>(
        &'a self,
        ctx: &'a Context,
        mutex: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        mut condition: P,
    ) -> impl Future<Output = MutexGuard<'a, T>> + Send + 'a
    where
        T: Send,
        P: FnMut(&mut T) -> bool + Send + 'a,
    {
        let mut guard = guard;
        let first = condition(&mut *guard).then(|| Notified {
            cv: self,
            waiter: self.enqueue(),
        });
        drop(guard);
        async move {
            let mut pending = first;
            loop {
                if let Some(notified) = pending.take() {
                    ctx.suspend(SuspendReason::Condition, notified).await;
                }
                let mut guard = relock(ctx, mutex).await;
                if !condition(&mut *guard) {
                    return guard;
                }
                pending = Some(Notified {
                    cv: self,
                    waiter: self.enqueue(),
                });
            }
        }
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

/// Coroutine side of a registered waiter
struct Notified<'a> {
    cv: &'a ConditionVariable,
    waiter: Arc<Waiter>,
}

impl Future for Notified<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<()> {
        let mut state = self.waiter.state.lock();
        if state.notified {
            return Poll::Ready(());
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for Notified<'_> {
    fn drop(&mut self) {
        // Abandoned before notification: pass a consumed notify_one on
        if !self.waiter.is_notified() && !self.cv.remove(&self.waiter) {
            self.cv.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_thread_wait_notify() {
        let shared = Arc::new((Mutex::new(false), ConditionVariable::new()));
        let other = shared.clone();
        let handle = thread::spawn(move || {
            let (flag, cv) = &*other;
            let mut guard = flag.lock();
            cv.wait_while(&mut guard, |ready| !*ready).unwrap();
            *guard
        });

        let (flag, cv) = &*shared;
        while cv.waiter_count() == 0 {
            thread::yield_now();
        }
        *flag.lock() = true;
        cv.notify_one();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wait_for_times_out() {
        let mutex = Mutex::new(());
        let cv = ConditionVariable::new();
        let mut guard = mutex.lock();
        let status = cv.wait_for(&mut guard, Duration::from_millis(20)).unwrap();
        assert_eq!(status, FutureStatus::Timeout);
        assert_eq!(cv.waiter_count(), 0);
    }

    #[test]
    fn test_notify_one_is_fifo() {
        let cv = ConditionVariable::new();
        let first = cv.enqueue();
        let second = cv.enqueue();
        cv.notify_one();
        assert!(first.is_notified());
        assert!(!second.is_notified());
        cv.notify_all();
        assert!(second.is_notified());
        assert_eq!(cv.waiter_count(), 0);
    }

    #[test]
    fn test_dropped_waiter_forwards_notification() {
        let cv = ConditionVariable::new();
        let abandoned = Notified {
            cv: &cv,
            waiter: cv.enqueue(),
        };
        let next = cv.enqueue();
        drop(abandoned);
        assert_eq!(cv.waiter_count(), 1);
        cv.notify_one();
        assert!(next.is_notified());
    }
}
