//! Promise / future result channels
//!
//! A `Promise<T>` is the write side of a single-assignment cell; its
//! `Future<T>` is the read side. Both threads and coroutines can wait on a
//! future: threads block on a condvar (`ThreadWait`), coroutines register a
//! waker and are re-queued on their own worker when the value lands
//! (`CoroWait`).
//!
//! Variants:
//! - `SharedFuture<T>`: broadcast read side, every clone observes the result
//! - `BufferPromise<T>` / `BufferFuture<T>`: ordered multi-value channel

mod buffer;
mod future;
mod state;

pub use buffer::{BufferFuture, BufferPromise, PullAsync};
pub use future::{Future, GetAsync, SharedFuture, SharedGetAsync};

use crate::error::{Error, Result};
use state::SharedState;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Outcome of a timed wait
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FutureStatus {
    /// The result (or buffered data) is available
    Ready,
    /// The timeout elapsed first
    Timeout,
}

/// Blocking wait capability, for plain threads.
///
/// Calling these on a coroutine worker thread fails with `WrongContext`.
pub trait ThreadWait {
    /// Block until ready
    fn wait(&self) -> Result<()>;

    /// Block until ready or until `timeout` elapses
    fn wait_for(&self, timeout: Duration) -> Result<FutureStatus>;
}

/// Poll-based wait capability, used by coroutines through `Context`.
pub trait CoroWait {
    /// Ready when the result is available; otherwise registers the waker
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()>;

    /// Non-blocking readiness check
    fn is_ready(&self) -> bool;
}

impl<W: CoroWait + ?Sized> CoroWait for &W {
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        (**self).poll_ready(cx)
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

/// Write side of a single-assignment result cell.
///
/// Dropping an unsatisfied promise breaks it: waiters observe `BrokenPromise`.
pub struct Promise<T> {
    state: Arc<SharedState<T>>,
    future_taken: bool,
}

impl<T> Promise<T> {
    /// Create an unsatisfied promise
    pub fn new() -> Self {
        Self {
            state: SharedState::new(),
            future_taken: false,
        }
    }

    /// Hand out the read side; fails with `FutureAlreadyRetrieved` the second time.
    pub fn get_future(&mut self) -> Result<Future<T>> {
        if self.future_taken {
            return Err(Error::FutureAlreadyRetrieved);
        }
        self.future_taken = true;
        Ok(Future::from_state(self.state.clone()))
    }

    /// Satisfy with a value
    pub fn set_value(&self, value: T) -> Result<()> {
        self.state.set(Ok(value))
    }

    /// Satisfy with an error
    pub fn set_exception(&self, error: Error) -> Result<()> {
        self.state.set(Err(error))
    }

    /// Satisfy with either
    pub fn set_result(&self, result: Result<T>) -> Result<()> {
        self.state.set(result)
    }

    /// Whether a value or error was already bound
    pub fn is_satisfied(&self) -> bool {
        !self.state.is_pending()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.state.abandon();
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("satisfied", &self.is_satisfied())
            .field("future_taken", &self.future_taken)
            .finish()
    }
}

/// Create a connected promise / future pair
pub fn channel<T>() -> (Promise<T>, Future<T>) {
    let state = SharedState::new();
    let future = Future::from_state(state.clone());
    (
        Promise {
            state,
            future_taken: true,
        },
        future,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_promise_set_value_once() {
        let (promise, future) = channel();
        promise.set_value(42).unwrap();
        assert!(matches!(
            promise.set_value(7),
            Err(Error::PromiseAlreadySatisfied)
        ));
        assert!(matches!(
            promise.set_exception(Error::msg("late")),
            Err(Error::PromiseAlreadySatisfied)
        ));
        assert_eq!(future.get().unwrap(), 42);
    }

    #[test]
    fn test_get_future_once() {
        let mut promise = Promise::<u32>::new();
        let _future = promise.get_future().unwrap();
        assert!(matches!(
            promise.get_future(),
            Err(Error::FutureAlreadyRetrieved)
        ));
    }

    #[test]
    fn test_second_get_and_wait_after_retrieval() {
        let (promise, future) = channel();
        promise.set_value("x").unwrap();
        assert!(future.valid());
        assert_eq!(future.get().unwrap(), "x");
        assert!(!future.valid());
        assert!(matches!(future.get(), Err(Error::FutureAlreadyRetrieved)));
        assert!(matches!(future.wait(), Err(Error::NoState)));
    }

    #[test]
    fn test_broken_promise() {
        let (promise, future) = channel::<u32>();
        let waiter = thread::spawn(move || future.get());
        thread::sleep(Duration::from_millis(10));
        drop(promise);
        assert!(matches!(waiter.join().unwrap(), Err(Error::BrokenPromise)));
    }

    #[test]
    fn test_try_get_before_ready() {
        let (promise, future) = channel();
        assert!(matches!(future.try_get(), Err(Error::PromiseNotSatisfied)));
        promise.set_value(1).unwrap();
        assert_eq!(future.try_get().unwrap(), 1);
    }

    #[test]
    fn test_exception_propagates() {
        let (promise, future) = channel::<u32>();
        promise.set_exception(Error::msg("no luck")).unwrap();
        assert!(matches!(future.get(), Err(Error::Message(ref m)) if m == "no luck"));
    }

    #[test]
    fn test_shared_future_many_readers() {
        let (promise, future) = channel();
        let shared = future.share();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || shared.get())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        promise.set_value(String::from("hello")).unwrap();

        for reader in readers {
            assert_eq!(reader.join().unwrap().unwrap(), "hello");
        }
        assert_eq!(shared.get().unwrap(), "hello");
    }

    #[test]
    fn test_ready_future() {
        let future = Future::ready(5u8);
        assert!(future.is_ready());
        assert_eq!(future.wait_for(Duration::ZERO).unwrap(), FutureStatus::Ready);
        assert_eq!(future.get().unwrap(), 5);
    }
}
