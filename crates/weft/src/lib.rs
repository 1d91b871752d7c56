//! Weft: cooperative coroutine runtime
//!
//! This crate provides:
//! - A coroutine worker pool (one ready list per thread) and a blocking IO pool
//! - Promise / future result channels usable from threads and coroutines
//! - Streaming buffers (`BufferPromise` / `BufferFuture`)
//! - Coroutine contexts: yield, wait, timed wait, sleep, fork/join
//! - A condition variable that never parks a coroutine worker
//! - A sequencer that runs same-key tasks in submission order
//! - Pluggable frame allocators for coroutine state
//! - Coroutine-local storage and task lifecycle notifications
//!
//! ```ignore
//! use weft::{Configuration, Dispatcher};
//!
//! let dispatcher = Dispatcher::new(Configuration::default())?;
//! let answer = dispatcher.post(|_ctx| async { Ok(6 * 7) })?;
//! assert_eq!(answer.get()?, 42);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod promise;
pub mod scheduler;
pub mod sequencer;
pub mod sync;

pub use config::{Configuration, FrameAllocatorConfig, LoadBalancePolicy};
pub use context::{Context, Sleep, StopToken, Suspend, YieldNow};
pub use dispatcher::{Chain, Dispatcher, PostOptions, QueueType, TerminateMode};
pub use error::{Error, Result};
pub use frame::{FrameAllocator, HeapAllocator, PoolAllocator};
pub use promise::{
    channel, BufferFuture, BufferPromise, CoroWait, Future, FutureStatus, Promise, SharedFuture,
    ThreadWait,
};
pub use scheduler::{
    current_task_id, is_coroutine_thread, QueueId, QueueStatistics, SuspendReason, TaskEvent,
    TaskId, TaskState, TaskStateConfiguration, TaskStateHandler, TaskType,
};
pub use sequencer::{SequenceKeyStatistics, Sequencer, SequencerConfiguration};
pub use sync::{ConditionVariable, Unlocked};
