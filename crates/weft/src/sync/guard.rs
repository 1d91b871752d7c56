//! Scoped unlock

use crate::context::Context;
use crate::scheduler::SuspendReason;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::future::Future;

/// Reacquire `mutex` from a coroutine without blocking its worker.
///
/// Each failed `try_lock` yields, so the holder (possibly a coroutine on the
/// same queue) can make progress.
pub(crate) async fn relock<'a, T>(ctx: &Context, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    loop {
        if let Some(guard) = mutex.try_lock() {
            return guard;
        }
        ctx.suspend(SuspendReason::Relock, ctx.yield_now()).await;
    }
}

/// A released lock that can be taken again on request.
///
/// The inverse of a `MutexGuard`: built from a guard, it releases the lock
/// immediately and hands out a new guard through [`Unlocked::relock`] or
/// [`Unlocked::relock_async`].
#[must_use = "dropping `Unlocked` leaves the mutex released"]
pub struct Unlocked<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Unlocked<'a, T> {
    /// Release `guard`
    pub fn new(guard: MutexGuard<'a, T>) -> Self {
        let mutex = MutexGuard::mutex(&guard);
        drop(guard);
        Self { mutex }
    }

    /// The mutex this handle refers to
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    /// Block the calling thread until the lock is held again.
    pub fn relock(self) -> MutexGuard<'a, T> {
        self.mutex.lock()
    }

    /// Reacquire from a coroutine, yielding while the lock is contended.
    pub fn relock_async(self, ctx: &'a Context) -> impl Future<Output = MutexGuard<'a, T>> + Send + 'a
    where
        T: Send,
    {
        relock(ctx, self.mutex)
    }
}

impl<T> fmt::Debug for Unlocked<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unlocked")
            .field("locked", &self.mutex.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlocked_releases_and_relocks() {
        let mutex = Mutex::new(5);
        let guard = mutex.lock();
        let unlocked = Unlocked::new(guard);
        assert!(!mutex.is_locked());

        let mut guard = unlocked.relock();
        *guard += 1;
        assert!(mutex.is_locked());
        drop(guard);
        assert_eq!(*mutex.lock(), 6);
    }
}
