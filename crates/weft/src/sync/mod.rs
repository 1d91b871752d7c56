//! Synchronization primitives aware of coroutine workers
//!
//! Both types work on `parking_lot::Mutex`: threads block as usual, while
//! coroutines suspend and reacquire the lock with `try_lock` plus yield, so a
//! worker thread never parks on a contended lock.

mod condvar;
mod guard;

pub use condvar::ConditionVariable;
pub use guard::Unlocked;
