//! Task lifecycle notifications
//!
//! An optional handler is told when tasks start, suspend, resume and stop.
//! A coroutine reports `Started` on its first poll, `Suspended` whenever a
//! poll returns pending (yields included), `Resumed` on every later poll and
//! `Stopped` when it completes or is cancelled after starting. IO jobs only
//! report `Started` and `Stopped`.

use crate::scheduler::task::TaskId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Kind of task a notification is about
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Coroutine running on a coroutine queue
    Coroutine,
    /// Blocking job running on an IO queue
    Io,
}

impl TaskType {
    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Lifecycle step reported to a [`TaskStateHandler`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskEvent {
    /// First poll (or the IO job began)
    Started,
    /// A poll returned without finishing
    Suspended,
    /// Polled again after a suspension
    Resumed,
    /// Finished, failed or cancelled after starting
    Stopped,
}

impl TaskEvent {
    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Callback invoked with the task id, its queue index, its type and the event.
///
/// Runs on the worker thread that drives the task; it should be quick.
pub type TaskStateHandler = Arc<dyn Fn(TaskId, usize, TaskType, TaskEvent) + Send + Sync>;

const ALL_EVENTS: u8 = 0b1111;
const ALL_TYPES: u8 = 0b11;

/// Which lifecycle events reach the handler
#[derive(Clone, Default)]
pub struct TaskStateConfiguration {
    handler: Option<TaskStateHandler>,
    events: u8,
    types: u8,
}

impl TaskStateConfiguration {
    /// Report every event of every task type to `handler`
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(TaskId, usize, TaskType, TaskEvent) + Send + Sync + 'static,
    {
        Self {
            handler: Some(Arc::new(handler)),
            events: ALL_EVENTS,
            types: ALL_TYPES,
        }
    }

    /// Only report the given events
    pub fn with_events(mut self, events: &[TaskEvent]) -> Self {
        self.events = events.iter().fold(0, |mask, e| mask | e.bit());
        self
    }

    /// Only report tasks of the given types
    pub fn with_task_types(mut self, types: &[TaskType]) -> Self {
        self.types = types.iter().fold(0, |mask, t| mask | t.bit());
        self
    }

    /// Whether any notification can be delivered
    pub fn is_enabled(&self) -> bool {
        self.handler.is_some() && self.events != 0 && self.types != 0
    }

    pub(crate) fn report(&self, id: TaskId, queue: usize, kind: TaskType, event: TaskEvent) {
        let Some(handler) = &self.handler else {
            return;
        };
        if self.events & event.bit() == 0 || self.types & kind.bit() == 0 {
            return;
        }
        // A failing handler must not take the worker down with it
        if catch_unwind(AssertUnwindSafe(|| handler(id, queue, kind, event))).is_err() {
            log::warn!(
                "task state handler panicked on {:?} for task {}",
                event,
                id.as_u64()
            );
        }
    }
}

impl PartialEq for TaskStateConfiguration {
    fn eq(&self, other: &Self) -> bool {
        let same_handler = match (&self.handler, &other.handler) {
            (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (None, None) => true,
            _ => false,
        };
        same_handler && self.events == other.events && self.types == other.types
    }
}

impl Eq for TaskStateConfiguration {}

impl fmt::Debug for TaskStateConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStateConfiguration")
            .field("handler", &self.handler.is_some())
            .field("events", &format_args!("{:#06b}", self.events))
            .field("types", &format_args!("{:#04b}", self.types))
            .finish()
    }
}
