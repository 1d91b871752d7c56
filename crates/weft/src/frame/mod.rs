//! Coroutine frames
//!
//! A `Frame` owns one type-erased coroutine state machine placed in memory
//! obtained from a `FrameAllocator`. Dropping the frame runs the state
//! machine's destructor (releasing everything the body captured, including
//! its promise) and returns the memory to the allocator.

pub mod alloc;

pub use alloc::{FrameAllocator, HeapAllocator, PoolAllocator, BLOCK_ALIGN};

use crate::error::Result;
use std::alloc::Layout;
use std::future::Future;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::task::{Context, Poll};

type ErasedFuture<O> = dyn Future<Output = O> + Send;

/// Pinned, allocator-backed coroutine state
pub(crate) struct Frame<O: 'static = ()> {
    ptr: NonNull<ErasedFuture<O>>,
    layout: Layout,
    allocator: Arc<dyn FrameAllocator>,
}

// SAFETY: the erased future is Send and the frame has unique ownership of it
unsafe impl<O: 'static> Send for Frame<O> {}

impl<O: 'static> Frame<O> {
    /// Move `future` into memory from `allocator`.
    pub(crate) fn new<F>(future: F, allocator: Arc<dyn FrameAllocator>) -> Result<Self>
    where
        F: Future<Output = O> + Send + 'static,
    {
        let layout = Layout::new::<F>();
        let raw = allocator.allocate(layout)?.cast::<F>();
        // SAFETY: raw is valid and aligned for F
        unsafe { raw.as_ptr().write(future) };
        let ptr: NonNull<ErasedFuture<O>> = raw;
        Ok(Self {
            ptr,
            layout,
            allocator,
        })
    }

    /// Poll the state machine once.
    pub(crate) fn poll(&mut self, cx: &mut Context<'_>) -> Poll<O> {
        // SAFETY: the state never moves until dropped in place
        let future = unsafe { Pin::new_unchecked(self.ptr.as_mut()) };
        future.poll(cx)
    }

    /// Bytes occupied by the state machine
    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }
}

impl<O: 'static> Drop for Frame<O> {
    fn drop(&mut self) {
        // SAFETY: ptr holds an initialized value allocated with `layout`
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            self.allocator.deallocate(self.ptr.cast::<u8>(), self.layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Waker;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_frame_poll_and_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let guard = DropCounter(drops.clone());
        let polled = Arc::new(AtomicUsize::new(0));
        let polled2 = polled.clone();

        let mut frame = Frame::new(
            async move {
                let _guard = guard;
                polled2.fetch_add(1, Ordering::SeqCst);
            },
            Arc::new(HeapAllocator),
        )
        .unwrap();

        let mut cx = Context::from_waker(Waker::noop());
        assert!(frame.poll(&mut cx).is_ready());
        assert_eq!(polled.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(frame);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unpolled_frame_drops_captures() {
        let drops = Arc::new(AtomicUsize::new(0));
        let guard = DropCounter(drops.clone());
        let frame = Frame::new(
            async move {
                let _guard = guard;
            },
            Arc::new(HeapAllocator),
        )
        .unwrap();
        drop(frame);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_frame_returns_pool_block() {
        let pool = Arc::new(PoolAllocator::new(256, 1, false).unwrap());
        let frame = Frame::new(async {}, pool.clone()).unwrap();
        assert_eq!(pool.available(), 0);
        assert!(frame.size() <= 256);

        // Pool is exhausted: the second frame fails
        assert!(Frame::new(async {}, pool.clone()).is_err());

        drop(frame);
        assert_eq!(pool.available(), 1);
    }
}
