//! Key-ordered admission on top of a dispatcher
//!
//! Tasks sharing a sequence key run strictly in submission order; tasks on
//! disjoint keys run concurrently. A task is built up front but only handed
//! to its queue once every predecessor has finished. `enqueue_all` submits
//! against the universal key: it runs after everything submitted before it
//! and everything submitted after it waits for it.
//!
//! Keys are collected eagerly: when a task finishes, each of its keys whose
//! tail is still that task is removed from the map.

mod chain;
mod config;
mod stats;

pub use config::{ExceptionCallback, SequencerConfiguration, DEFAULT_BUCKET_COUNT};
pub use stats::SequenceKeyStatistics;

use crate::context::Context;
use crate::dispatcher::core::Core;
use crate::dispatcher::{Dispatcher, PostOptions};
use crate::error::{Error, Result};
use crate::promise::{Future, FutureStatus, ThreadWait};
use crate::scheduler::task::Guarded;
use chain::{ChainLink, Gate};
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use stats::StatsWriter;
use std::collections::HashMap;
use std::fmt;
use std::future::Future as StdFuture;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

// ============================================================================
// Shared state
// ============================================================================

struct KeyData {
    tail: Arc<ChainLink>,
    stats: Arc<StatsWriter>,
}

struct Chains<K, S> {
    keys: HashMap<K, KeyData, S>,
    universal: Option<Arc<ChainLink>>,
}

struct Inner<K, S> {
    chains: Mutex<Chains<K, S>>,
    universal_stats: Arc<StatsWriter>,
    task_stats: StatsWriter,
    draining: AtomicBool,
    callback: Option<ExceptionCallback>,
}

enum Scope<K> {
    Keys(Vec<K>),
    Universal,
}

/// Bookkeeping of one sequenced task, shared by its body and its finish guard
struct Ticket<K, S> {
    inner: Arc<Inner<K, S>>,
    link: Arc<ChainLink>,
    scope: Scope<K>,
    posted_at: Instant,
    // Set once the task is linked into the chains
    writers: OnceLock<Vec<Arc<StatsWriter>>>,
}

impl<K: Hash + Eq, S: BuildHasher> Ticket<K, S> {
    fn admitted(&self) {
        let wait = self.posted_at.elapsed();
        self.inner.task_stats.on_admit(wait);
        for writer in self.writers.get().into_iter().flatten() {
            writer.on_admit(wait);
        }
    }

    /// Collect finished keys, then open the successors' gates.
    fn finish(&self) {
        let Some(writers) = self.writers.get() else {
            return;
        };
        {
            let mut chains = self.inner.chains.lock();
            match &self.scope {
                Scope::Keys(keys) => {
                    for key in keys {
                        let is_tail = chains
                            .keys
                            .get(key)
                            .is_some_and(|data| Arc::ptr_eq(&data.tail, &self.link));
                        if is_tail {
                            chains.keys.remove(key);
                        }
                    }
                }
                Scope::Universal => {
                    let is_tail = chains
                        .universal
                        .as_ref()
                        .is_some_and(|tail| Arc::ptr_eq(tail, &self.link));
                    if is_tail {
                        chains.universal = None;
                    }
                }
            }
        }
        self.inner.task_stats.on_finish();
        for writer in writers {
            writer.on_finish();
        }
        // Gates are opened outside the map lock: opening may cancel a task
        // whose frame re-enters `finish`
        for gate in self.link.finish() {
            gate.arrive();
        }
    }
}

/// Runs on completion, failure or cancellation of the task's frame
struct FinishGuard<K: Hash + Eq, S: BuildHasher>(Arc<Ticket<K, S>>);

impl<K: Hash + Eq, S: BuildHasher> Drop for FinishGuard<K, S> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

// ============================================================================
// Sequencer
// ============================================================================

/// Orders task execution per sequence key.
///
/// Cloning is cheap; clones share the same chains.
pub struct Sequencer<K, S = FxBuildHasher> {
    core: Arc<Core>,
    inner: Arc<Inner<K, S>>,
}

impl<K, S> Clone for Sequencer<K, S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<K, S> Sequencer<K, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    /// Build a sequencer that posts onto `dispatcher`
    pub fn new(dispatcher: &Dispatcher, config: SequencerConfiguration<S>) -> Self {
        let keys = HashMap::with_capacity_and_hasher(config.bucket_count, config.hasher);
        Self {
            core: dispatcher.core().clone(),
            inner: Arc::new(Inner {
                chains: Mutex::new(Chains {
                    keys,
                    universal: None,
                }),
                universal_stats: Arc::new(StatsWriter::default()),
                task_stats: StatsWriter::default(),
                draining: AtomicBool::new(false),
                callback: config.exception_callback,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Run `body` after every earlier task on `key`.
    pub fn enqueue<T, F, Fut>(&self, key: K, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.submit(PostOptions::default(), Scope::Keys(vec![key]), body, true)
    }

    /// [`Sequencer::enqueue`] with explicit options.
    pub fn enqueue_with<T, F, Fut>(&self, options: PostOptions, key: K, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.submit(options, Scope::Keys(vec![key]), body, true)
    }

    /// Run `body` after every earlier task on any of `keys`.
    pub fn enqueue_multi<T, F, Fut>(&self, keys: Vec<K>, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.submit(PostOptions::default(), Scope::Keys(keys), body, true)
    }

    /// [`Sequencer::enqueue_multi`] with explicit options.
    pub fn enqueue_multi_with<T, F, Fut>(
        &self,
        options: PostOptions,
        keys: Vec<K>,
        body: F,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.submit(options, Scope::Keys(keys), body, true)
    }

    /// Run `body` after everything pending, ahead of everything that follows.
    pub fn enqueue_all<T, F, Fut>(&self, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.submit(PostOptions::default(), Scope::Universal, body, true)
    }

    /// [`Sequencer::enqueue_all`] with explicit options.
    pub fn enqueue_all_with<T, F, Fut>(&self, options: PostOptions, body: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.submit(options, Scope::Universal, body, true)
    }

    fn submit<T, F, Fut>(
        &self,
        options: PostOptions,
        scope: Scope<K>,
        body: F,
        check_draining: bool,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: StdFuture<Output = Result<T>> + Send + 'static,
    {
        self.core.check_posting()?;
        if check_draining
            && self.inner.draining.load(Ordering::Acquire)
            && !self.core.on_worker_thread()
        {
            return Err(Error::Draining);
        }

        let scope = match scope {
            Scope::Keys(keys) => {
                let mut unique: Vec<K> = Vec::with_capacity(keys.len());
                for key in keys {
                    if !unique.contains(&key) {
                        unique.push(key);
                    }
                }
                Scope::Keys(unique)
            }
            Scope::Universal => Scope::Universal,
        };

        let ticket = Arc::new(Ticket {
            inner: self.inner.clone(),
            link: ChainLink::new(),
            scope,
            posted_at: Instant::now(),
            writers: OnceLock::new(),
        });

        let finish = FinishGuard(ticket.clone());
        let admitted = ticket.clone();
        let (task, future) = self.core.prepare(&options, move |ctx: Context| async move {
            let _finish = finish;
            admitted.admitted();
            let result = Guarded::new(async move { body(ctx).await }).await;
            if let (Err(error), Some(callback)) = (&result, &admitted.inner.callback) {
                callback(error);
            }
            result
        })?;

        let gate = Gate::new();
        {
            let mut chains = self.inner.chains.lock();
            let chains = &mut *chains;
            let mut writers = Vec::new();

            let depend_on = |link: &Arc<ChainLink>| {
                gate.hold();
                if !link.attach(gate.clone()) {
                    // Cannot reach zero: the submitter still holds its count
                    gate.arrive();
                }
            };

            if let Some(universal) = &chains.universal {
                depend_on(universal);
            }
            match &ticket.scope {
                Scope::Keys(keys) => {
                    for key in keys {
                        match chains.keys.get_mut(key) {
                            Some(data) => {
                                depend_on(&data.tail);
                                data.tail = ticket.link.clone();
                                writers.push(data.stats.clone());
                            }
                            None => {
                                let stats = Arc::new(StatsWriter::default());
                                chains.keys.insert(
                                    key.clone(),
                                    KeyData {
                                        tail: ticket.link.clone(),
                                        stats: stats.clone(),
                                    },
                                );
                                writers.push(stats);
                            }
                        }
                    }
                }
                Scope::Universal => {
                    for data in chains.keys.values() {
                        depend_on(&data.tail);
                    }
                    chains.universal = Some(ticket.link.clone());
                    writers.push(self.inner.universal_stats.clone());
                }
            }

            self.inner.task_stats.on_post();
            for writer in &writers {
                writer.on_post();
            }
            let _ = ticket.writers.set(writers);
        }

        let core = self.core.clone();
        gate.set_release(move || {
            let _ = core.schedule(&task);
        });
        gate.arrive();
        Ok(future)
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Drop keys whose last task already finished; returns the remaining count.
    pub fn trim_sequence_keys(&self) -> usize {
        let mut chains = self.inner.chains.lock();
        chains.keys.retain(|_, data| !data.tail.is_finished());
        if chains.universal.as_ref().is_some_and(|u| u.is_finished()) {
            chains.universal = None;
        }
        chains.keys.len()
    }

    /// Number of keys with a live chain
    pub fn sequence_key_count(&self) -> usize {
        self.inner.chains.lock().keys.len()
    }

    /// Statistics of `key`, if it has a live chain
    pub fn statistics(&self, key: &K) -> Option<SequenceKeyStatistics> {
        self.inner
            .chains
            .lock()
            .keys
            .get(key)
            .map(|data| data.stats.snapshot())
    }

    /// Statistics of `enqueue_all` submissions
    pub fn universal_statistics(&self) -> SequenceKeyStatistics {
        self.inner.universal_stats.snapshot()
    }

    /// Statistics over every task this sequencer accepted
    pub fn task_statistics(&self) -> SequenceKeyStatistics {
        self.inner.task_stats.snapshot()
    }

    /// Wait until everything submitted so far has finished.
    ///
    /// Submissions from outside the dispatcher fail with `Draining` while this
    /// runs, and afterwards too when `is_final` is set. Returns false on
    /// timeout or when called from a coroutine worker.
    pub fn drain(&self, timeout: Option<Duration>, is_final: bool) -> bool {
        self.inner.draining.store(true, Ordering::Release);
        let marker: Result<Future<()>> = self.submit(
            PostOptions::default(),
            Scope::Universal,
            |_| async { Ok(()) },
            false,
        );
        let drained = match marker {
            Ok(marker) => match timeout {
                Some(timeout) => matches!(marker.wait_for(timeout), Ok(FutureStatus::Ready)),
                None => marker.wait().is_ok(),
            },
            Err(error) => {
                log::warn!("sequencer drain could not post its marker: {}", error);
                false
            }
        };
        if !is_final {
            self.inner.draining.store(false, Ordering::Release);
        }
        log::debug!("sequencer drain finished (empty: {})", drained);
        drained
    }

    /// Whether submissions are currently refused
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }
}

impl<K, S> fmt::Debug for Sequencer<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("keys", &self.inner.chains.lock().keys.len())
            .field("draining", &self.inner.draining.load(Ordering::Relaxed))
            .finish()
    }
}
