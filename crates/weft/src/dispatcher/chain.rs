//! Continuation chains
//!
//! `post_first(..).then(..).on_error(..).finally(..).end()` runs every stage
//! inside one coroutine, in order. A failing stage skips the following
//! `then` stages up to the next `on_error`, which may recover; `finally`
//! always runs and sees the result so far. Panics inside a stage count as
//! errors of that stage.

use crate::context::Context;
use crate::dispatcher::core::Core;
use crate::dispatcher::PostOptions;
use crate::error::{Error, Result};
use crate::promise::Future;
use crate::scheduler::task::Guarded;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::Arc;

type StageFuture<T> = Pin<Box<dyn StdFuture<Output = Result<T>> + Send>>;
type Stage<T> = Box<dyn FnOnce(Context) -> StageFuture<T> + Send>;

/// Builder returned by [`Dispatcher::post_first`](crate::Dispatcher::post_first).
///
/// Nothing runs until [`Chain::end`] posts the whole chain.
#[must_use = "a chain does nothing until `end` is called"]
pub struct Chain<T> {
    core: Arc<Core>,
    options: PostOptions,
    stage: Stage<T>,
}

impl<T: Send + 'static> Chain<T> {
    pub(crate) fn new<F, Fut>(core: Arc<Core>, options: PostOptions, body: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        let stage: Stage<T> = Box::new(move |ctx: Context| -> StageFuture<T> {
            Box::pin(Guarded::new(async move { body(ctx).await }))
        });
        Self {
            core,
            options,
            stage,
        }
    }

    /// Continue with the previous stage's value.
    pub fn then<U, F, Fut>(self, next: F) -> Chain<U>
    where
        U: Send + 'static,
        F: FnOnce(Context, T) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<U>> + Send + 'static,
    {
        let Chain {
            core,
            options,
            stage: previous,
        } = self;
        let stage: Stage<U> = Box::new(move |ctx: Context| -> StageFuture<U> {
            Box::pin(async move {
                let value = previous(ctx.clone()).await?;
                Guarded::new(async move { next(ctx, value).await }).await
            })
        });
        Chain {
            core,
            options,
            stage,
        }
    }

    /// Recover from an error raised by any earlier stage.
    pub fn on_error<F, Fut>(self, handler: F) -> Chain<T>
    where
        F: FnOnce(Context, Error) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        let Chain {
            core,
            options,
            stage: previous,
        } = self;
        let stage: Stage<T> = Box::new(move |ctx: Context| -> StageFuture<T> {
            Box::pin(async move {
                match previous(ctx.clone()).await {
                    Ok(value) => Ok(value),
                    Err(error) => Guarded::new(async move { handler(ctx, error).await }).await,
                }
            })
        });
        Chain {
            core,
            options,
            stage,
        }
    }

    /// Always run, with the outcome of everything before.
    pub fn finally<U, F, Fut>(self, last: F) -> Chain<U>
    where
        U: Send + 'static,
        F: FnOnce(Context, Result<T>) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<U>> + Send + 'static,
    {
        let Chain {
            core,
            options,
            stage: previous,
        } = self;
        let stage: Stage<U> = Box::new(move |ctx: Context| -> StageFuture<U> {
            Box::pin(async move {
                let outcome = previous(ctx.clone()).await;
                Guarded::new(async move { last(ctx, outcome).await }).await
            })
        });
        Chain {
            core,
            options,
            stage,
        }
    }

    /// Post the chain as one coroutine.
    pub fn end(self) -> Result<Future<T>> {
        let Chain {
            core,
            options,
            stage,
        } = self;
        core.post(options, move |ctx| stage(ctx))
    }
}
