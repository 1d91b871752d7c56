//! Shared state between a promise and its future(s).

use crate::error::{Error, Result};
use crate::promise::FutureStatus;
use parking_lot::{Condvar, Mutex};
use std::mem;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

enum Slot<T> {
    Pending,
    Ready(Result<T>),
    Retrieved,
}

struct Inner<T> {
    slot: Slot<T>,
    waiters: Vec<Waker>,
}

impl<T> Inner<T> {
    /// Keep one waker per task; every distinct waiter is woken on set.
    fn register(&mut self, waker: &Waker) {
        if !self.waiters.iter().any(|w| w.will_wake(waker)) {
            self.waiters.push(waker.clone());
        }
    }
}

/// Single-assignment value-or-error cell.
///
/// Set at most once by the producing side. Threads block on the condvar;
/// coroutines register a waker and are re-queued when the state is set.
pub(crate) struct SharedState<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> SharedState<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                slot: Slot::Pending,
                waiters: Vec::new(),
            }),
            ready: Condvar::new(),
        })
    }

    /// Bind the result; fails if already set.
    pub(crate) fn set(&self, result: Result<T>) -> Result<()> {
        let waiters = {
            let mut inner = self.inner.lock();
            if !matches!(inner.slot, Slot::Pending) {
                return Err(Error::PromiseAlreadySatisfied);
            }
            inner.slot = Slot::Ready(result);
            mem::take(&mut inner.waiters)
        };
        // Several threads or coroutines may wait on one `&Future`
        self.ready.notify_all();
        for waker in waiters {
            waker.wake();
        }
        Ok(())
    }

    /// Break the state if it was never set.
    pub(crate) fn abandon(&self) {
        if self.set(Err(Error::BrokenPromise)).is_ok() {
            log::trace!("promise broken");
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Pending)
    }

    pub(crate) fn is_retrieved(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Retrieved)
    }

    // ------------------------------------------------------------------------
    // Single consumer
    // ------------------------------------------------------------------------

    fn take_ready(inner: &mut Inner<T>) -> Option<Result<T>> {
        match mem::replace(&mut inner.slot, Slot::Retrieved) {
            Slot::Ready(result) => Some(result),
            Slot::Retrieved => Some(Err(Error::FutureAlreadyRetrieved)),
            Slot::Pending => {
                inner.slot = Slot::Pending;
                None
            }
        }
    }

    /// Block until set, then move the result out.
    pub(crate) fn take(&self) -> Result<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(result) = Self::take_ready(&mut inner) {
                return result;
            }
            self.ready.wait(&mut inner);
        }
    }

    pub(crate) fn try_take(&self) -> Result<T> {
        let mut inner = self.inner.lock();
        Self::take_ready(&mut inner).unwrap_or(Err(Error::PromiseNotSatisfied))
    }

    pub(crate) fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut inner = self.inner.lock();
        match Self::take_ready(&mut inner) {
            Some(result) => Poll::Ready(result),
            None => {
                inner.register(cx.waker());
                Poll::Pending
            }
        }
    }

    // ------------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------------

    /// Block until set. Fails with `NoState` once the value was retrieved.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.slot {
                Slot::Pending => self.ready.wait(&mut inner),
                Slot::Ready(_) => return Ok(()),
                Slot::Retrieved => return Err(Error::NoState),
            }
        }
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> Result<FutureStatus> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match inner.slot {
                Slot::Ready(_) => return Ok(FutureStatus::Ready),
                Slot::Retrieved => return Err(Error::NoState),
                Slot::Pending => {
                    if self.ready.wait_until(&mut inner, deadline).timed_out() {
                        return Ok(if matches!(inner.slot, Slot::Pending) {
                            FutureStatus::Timeout
                        } else {
                            FutureStatus::Ready
                        });
                    }
                }
            }
        }
    }

    /// Ready once set (or retrieved, in which case there is nothing to wait for).
    pub(crate) fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.inner.lock();
        if matches!(inner.slot, Slot::Pending) {
            inner.register(cx.waker());
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

// ----------------------------------------------------------------------------
// Broadcast consumers
// ----------------------------------------------------------------------------

impl<T: Clone> SharedState<T> {
    fn clone_ready(inner: &Inner<T>) -> Option<Result<T>> {
        match &inner.slot {
            Slot::Pending => None,
            Slot::Ready(result) => Some(result.clone()),
            Slot::Retrieved => Some(Err(Error::NoState)),
        }
    }

    pub(crate) fn get_cloned(&self) -> Result<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(result) = Self::clone_ready(&inner) {
                return result;
            }
            self.ready.wait(&mut inner);
        }
    }

    pub(crate) fn try_get_cloned(&self) -> Result<T> {
        Self::clone_ready(&self.inner.lock()).unwrap_or(Err(Error::PromiseNotSatisfied))
    }

    pub(crate) fn poll_cloned(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut inner = self.inner.lock();
        match Self::clone_ready(&inner) {
            Some(result) => Poll::Ready(result),
            None => {
                inner.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;
    use std::thread;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        (counter, waker)
    }

    #[test]
    fn test_set_once() {
        let state = SharedState::new();
        state.set(Ok(1)).unwrap();
        assert!(matches!(
            state.set(Ok(2)),
            Err(Error::PromiseAlreadySatisfied)
        ));
        assert_eq!(state.take().unwrap(), 1);
        assert!(matches!(state.take(), Err(Error::FutureAlreadyRetrieved)));
        assert!(matches!(state.wait(), Err(Error::NoState)));
    }

    #[test]
    fn test_abandon_only_breaks_pending() {
        let state = SharedState::<u32>::new();
        state.set(Ok(5)).unwrap();
        state.abandon();
        assert_eq!(state.take().unwrap(), 5);

        let state = SharedState::<u32>::new();
        state.abandon();
        assert!(matches!(state.take(), Err(Error::BrokenPromise)));
    }

    #[test]
    fn test_every_waiter_is_woken() {
        let state = SharedState::<u32>::new();
        let (first, first_waker) = counting();
        let (second, second_waker) = counting();

        assert!(state
            .poll_ready(&mut Context::from_waker(&first_waker))
            .is_pending());
        assert!(state
            .poll_ready(&mut Context::from_waker(&second_waker))
            .is_pending());
        // Re-polling the same task does not register it twice
        assert!(state
            .poll_ready(&mut Context::from_waker(&first_waker))
            .is_pending());
        state.set(Ok(1)).unwrap();

        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
        assert_eq!(state.take().unwrap(), 1);
    }

    #[test]
    fn test_cloned_readers_all_woken() {
        let state = SharedState::<u32>::new();
        let (first, first_waker) = counting();
        let (second, second_waker) = counting();

        assert!(state
            .poll_cloned(&mut Context::from_waker(&first_waker))
            .is_pending());
        assert!(state
            .poll_cloned(&mut Context::from_waker(&second_waker))
            .is_pending());
        state.set(Ok(9)).unwrap();

        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
        assert_eq!(state.get_cloned().unwrap(), 9);
        assert_eq!(state.get_cloned().unwrap(), 9);
    }

    #[test]
    fn test_wait_for_timeout_then_ready() {
        let state = SharedState::<u32>::new();
        assert_eq!(
            state.wait_for(Duration::from_millis(10)).unwrap(),
            FutureStatus::Timeout
        );

        let setter = state.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set(Ok(3)).unwrap();
        });
        assert_eq!(
            state.wait_for(Duration::from_secs(5)).unwrap(),
            FutureStatus::Ready
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_try_take_before_ready() {
        let state = SharedState::<u32>::new();
        assert!(matches!(state.try_take(), Err(Error::PromiseNotSatisfied)));
        assert!(state.is_pending());
        state.set(Ok(1)).unwrap();
        assert_eq!(state.try_take().unwrap(), 1);
        assert!(state.is_retrieved());
    }
}
