//! Runtime error types.

use std::sync::Arc;

/// Errors raised by promises, futures, queues and task bodies.
///
/// The set is closed: every failure the runtime can report is one of these
/// variants, so callers can match exhaustively.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// `set_value`/`set_exception` called on an already satisfied promise
    #[error("promise already satisfied")]
    PromiseAlreadySatisfied,

    /// The future (or its value) was already taken
    #[error("future already retrieved")]
    FutureAlreadyRetrieved,

    /// The promise was dropped before being satisfied
    #[error("broken promise")]
    BrokenPromise,

    /// The future no longer refers to a shared state
    #[error("no associated state")]
    NoState,

    /// Non-blocking read of a promise that is not satisfied yet
    #[error("promise not satisfied")]
    PromiseNotSatisfied,

    /// The buffer was closed and fully drained
    #[error("buffer closed")]
    BufferClosed,

    /// Data pushed into a buffer after it was closed
    #[error("cannot push data into a closed buffer")]
    BufferingData,

    /// The target queue no longer accepts tasks
    #[error("queue closed")]
    QueueClosed,

    /// The frame allocator could not provide memory for a coroutine
    #[error("coroutine frame allocation failed ({size} bytes)")]
    AllocationFailure {
        /// Requested frame size in bytes
        size: usize,
    },

    /// A blocking wait was attempted on a coroutine worker thread
    #[error("blocking wait called from a coroutine worker thread")]
    WrongContext,

    /// Queue id outside the configured pool
    #[error("invalid queue id {0}")]
    InvalidQueue(usize),

    /// Posting is disabled while draining
    #[error("posting is disabled while draining")]
    Draining,

    /// The task body panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Error raised by a task body with a plain message
    #[error("{0}")]
    Message(String),

    /// Error raised by a task body wrapping an arbitrary error value
    #[error("{0}")]
    Exception(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap an arbitrary error raised inside a task body.
    pub fn exception<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Exception(Arc::new(error))
    }

    /// Build an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    /// Build a `Panicked` error from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Error::Panicked(message)
    }

    /// Whether this error was raised by a task body rather than by the runtime.
    pub fn is_task_error(&self) -> bool {
        matches!(
            self,
            Error::Panicked(_) | Error::Message(_) | Error::Exception(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::exception(error)
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
