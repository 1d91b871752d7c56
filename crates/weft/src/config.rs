//! Dispatcher configuration
//!
//! All options have defaults; the struct deserializes from any serde format
//! with missing fields falling back to those defaults.

use crate::scheduler::TaskStateConfiguration;
use serde::{Deserialize, Serialize};

/// Default number of IO worker threads
pub const DEFAULT_IO_THREADS: usize = 5;

/// How `QueueId::Any` submissions pick a queue
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    /// Rotate through the eligible queues
    #[default]
    RoundRobin,
    /// Pick the queue with the fewest queued + running tasks
    ShortestQueue,
}

/// Frame allocator selection
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameAllocatorConfig {
    /// Every frame comes from the global allocator
    #[default]
    Heap,
    /// Frames come from a contiguous pool of fixed-size blocks
    Pool {
        /// Size of one block in bytes
        block_size: usize,
        /// Number of blocks in the pool
        block_count: usize,
        /// Fall back to the heap when the pool is exhausted or a frame does not fit
        heap_fallback: bool,
    },
}

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Coroutine worker threads (0 = number of CPUs)
    pub coro_threads: usize,

    /// IO worker threads (at least one is always started)
    pub io_threads: usize,

    /// Placement policy for `QueueId::Any`
    pub load_balance: LoadBalancePolicy,

    /// Inclusive range of coroutine queues eligible for `QueueId::Any`
    /// (None = all queues)
    pub coro_queue_range_for_any: Option<(usize, usize)>,

    /// Coroutine frame allocator
    pub frame_allocator: FrameAllocatorConfig,

    /// Prefix for worker thread names
    pub thread_name_prefix: String,

    /// Task lifecycle notifications (code only, never serialized)
    #[serde(skip)]
    pub task_state: TaskStateConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            coro_threads: 0,
            io_threads: DEFAULT_IO_THREADS,
            load_balance: LoadBalancePolicy::default(),
            coro_queue_range_for_any: None,
            frame_allocator: FrameAllocatorConfig::default(),
            thread_name_prefix: "weft".to_string(),
            task_state: TaskStateConfiguration::default(),
        }
    }
}

impl Configuration {
    /// Set the number of coroutine worker threads
    pub fn with_coro_threads(mut self, count: usize) -> Self {
        self.coro_threads = count;
        self
    }

    /// Set the number of IO worker threads
    pub fn with_io_threads(mut self, count: usize) -> Self {
        self.io_threads = count;
        self
    }

    /// Set the load-balancing policy for `QueueId::Any`
    pub fn with_load_balance(mut self, policy: LoadBalancePolicy) -> Self {
        self.load_balance = policy;
        self
    }

    /// Restrict `QueueId::Any` to the inclusive queue range `[first, last]`
    pub fn with_coro_queue_range_for_any(mut self, first: usize, last: usize) -> Self {
        self.coro_queue_range_for_any = Some((first, last));
        self
    }

    /// Select the frame allocator
    pub fn with_frame_allocator(mut self, allocator: FrameAllocatorConfig) -> Self {
        self.frame_allocator = allocator;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Install task lifecycle notifications
    pub fn with_task_state_handler(mut self, task_state: TaskStateConfiguration) -> Self {
        self.task_state = task_state;
        self
    }

    /// Effective coroutine thread count
    pub fn resolved_coro_threads(&self) -> usize {
        if self.coro_threads == 0 {
            num_cpus::get()
        } else {
            self.coro_threads
        }
    }

    /// Effective IO thread count
    pub fn resolved_io_threads(&self) -> usize {
        self.io_threads.max(1)
    }

    /// Effective `Any` range, clamped to the pool
    pub fn resolved_any_range(&self) -> (usize, usize) {
        let last_queue = self.resolved_coro_threads() - 1;
        match self.coro_queue_range_for_any {
            Some((first, last)) if first <= last && first <= last_queue => {
                (first, last.min(last_queue))
            }
            _ => (0, last_queue),
        }
    }
}
