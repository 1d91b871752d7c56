//! Coroutine frame allocators.
//!
//! A frame is the state machine of one coroutine body. Its memory comes from
//! a `FrameAllocator` chosen at dispatcher construction: either the global
//! heap or a contiguous pool of fixed-size blocks recycled through a free list.

use crate::config::FrameAllocatorConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Alignment (and size granularity) of pool blocks
pub const BLOCK_ALIGN: usize = 64;

/// Source of coroutine frame memory.
///
/// Implementations must be thread-safe: frames are allocated on the posting
/// thread and released on whichever worker finishes the task.
pub trait FrameAllocator: Send + Sync {
    /// Allocate memory for `layout`.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Release memory obtained from `allocate`.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Build the allocator described by a configuration entry
pub fn from_config(config: &FrameAllocatorConfig) -> Result<Arc<dyn FrameAllocator>> {
    match *config {
        FrameAllocatorConfig::Heap => Ok(Arc::new(HeapAllocator)),
        FrameAllocatorConfig::Pool {
            block_size,
            block_count,
            heap_fallback,
        } => Ok(Arc::new(PoolAllocator::new(
            block_size,
            block_count,
            heap_fallback,
        )?)),
    }
}

fn dangling_for(layout: Layout) -> NonNull<u8> {
    // A non-zero power of two is a valid, aligned, non-null address for a ZST.
    NonNull::new(std::ptr::without_provenance_mut(layout.align())).unwrap_or(NonNull::dangling())
}

// ============================================================================
// Heap
// ============================================================================

/// Allocates every frame from the global allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl FrameAllocator for HeapAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            return Ok(dangling_for(layout));
        }
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(Error::AllocationFailure {
            size: layout.size(),
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Contiguous region split into equal blocks.
///
/// Frames that fit in a block take one from the free list. Oversized frames,
/// and requests made while the pool is exhausted, go to the heap when
/// `heap_fallback` is set and fail with `AllocationFailure` otherwise.
pub struct PoolAllocator {
    base: NonNull<u8>,
    region: Layout,
    block_size: usize,
    block_count: usize,
    free: Mutex<Vec<usize>>,
    heap_fallback: bool,
}

// SAFETY: the region is only handed out block by block under the free-list lock
unsafe impl Send for PoolAllocator {}
unsafe impl Sync for PoolAllocator {}

impl PoolAllocator {
    /// Create a pool of `block_count` blocks of at least `block_size` bytes each.
    pub fn new(block_size: usize, block_count: usize, heap_fallback: bool) -> Result<Self> {
        let block_size = block_size.max(1).next_multiple_of(BLOCK_ALIGN);
        let total = block_size
            .checked_mul(block_count)
            .ok_or(Error::AllocationFailure { size: usize::MAX })?;
        let region = Layout::from_size_align(total, BLOCK_ALIGN)
            .map_err(|_| Error::AllocationFailure { size: total })?;

        let base = if total == 0 {
            dangling_for(region)
        } else {
            // SAFETY: region has a non-zero size
            NonNull::new(unsafe { alloc::alloc(region) })
                .ok_or(Error::AllocationFailure { size: total })?
        };

        // Reverse so low blocks are handed out first
        let free = (0..block_count).rev().collect();

        log::debug!(
            "frame pool: {} blocks of {} bytes (heap fallback: {})",
            block_count,
            block_size,
            heap_fallback
        );

        Ok(Self {
            base,
            region,
            block_size,
            block_count,
            free: Mutex::new(free),
            heap_fallback,
        })
    }

    /// Size of one block after rounding
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks
    pub fn capacity(&self) -> usize {
        self.block_count
    }

    /// Blocks currently on the free list
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= start && addr < start + self.region.size()
    }

    fn fallback(&self, layout: Layout) -> Result<NonNull<u8>> {
        if self.heap_fallback {
            HeapAllocator.allocate(layout)
        } else {
            Err(Error::AllocationFailure {
                size: layout.size(),
            })
        }
    }
}

impl FrameAllocator for PoolAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() > self.block_size || layout.align() > BLOCK_ALIGN {
            return self.fallback(layout);
        }

        let index = self.free.lock().pop();
        match index {
            // SAFETY: index < block_count, so the offset stays inside the region
            Some(index) => Ok(unsafe { self.base.add(index * self.block_size) }),
            None => self.fallback(layout),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if self.owns(ptr) {
            let index = (ptr.as_ptr() as usize - self.base.as_ptr() as usize) / self.block_size;
            self.free.lock().push(index);
        } else {
            HeapAllocator.deallocate(ptr, layout);
        }
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        if self.region.size() != 0 {
            // SAFETY: allocated in `new` with this layout
            unsafe { alloc::dealloc(self.base.as_ptr(), self.region) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocate_release() {
        let layout = Layout::from_size_align(256, 16).unwrap();
        let ptr = HeapAllocator.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        unsafe { HeapAllocator.deallocate(ptr, layout) };
    }

    #[test]
    fn test_pool_block_rounding() {
        let pool = PoolAllocator::new(100, 4, false).unwrap();
        assert_eq!(pool.block_size(), 128);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_pool_acquire_release() {
        let pool = PoolAllocator::new(64, 2, false).unwrap();
        let layout = Layout::from_size_align(48, 8).unwrap();

        let a = pool.allocate(layout).unwrap();
        let b = pool.allocate(layout).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available(), 0);

        // Exhausted without fallback
        let err = pool.allocate(layout).unwrap_err();
        assert!(matches!(err, Error::AllocationFailure { size: 48 }));

        unsafe { pool.deallocate(a, layout) };
        assert_eq!(pool.available(), 1);

        // Recycled block is handed out again
        let c = pool.allocate(layout).unwrap();
        assert_eq!(a, c);

        unsafe {
            pool.deallocate(b, layout);
            pool.deallocate(c, layout);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_heap_fallback() {
        let pool = PoolAllocator::new(64, 1, true).unwrap();
        let big = Layout::from_size_align(4096, 8).unwrap();

        // Oversized frame goes to the heap and leaves the pool alone
        let ptr = pool.allocate(big).unwrap();
        assert_eq!(pool.available(), 1);
        unsafe { pool.deallocate(ptr, big) };
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_pool_oversized_without_fallback() {
        let pool = PoolAllocator::new(64, 8, false).unwrap();
        let big = Layout::from_size_align(65, 8).unwrap();
        assert!(matches!(
            pool.allocate(big),
            Err(Error::AllocationFailure { size: 65 })
        ));
    }

    #[test]
    fn test_empty_pool() {
        let pool = PoolAllocator::new(64, 0, false).unwrap();
        let layout = Layout::from_size_align(8, 8).unwrap();
        assert!(pool.allocate(layout).is_err());
    }
}
