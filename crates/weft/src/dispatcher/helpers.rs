//! Fork/join helpers built on top of `post`.

use crate::context::Context;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::promise::Future;
use std::collections::BTreeMap;
use std::future::Future as StdFuture;
use std::sync::Arc;

/// Split `items` into at most `parts` contiguous, non-empty batches
fn split_batches<A>(items: Vec<A>, parts: usize) -> Vec<Vec<A>> {
    let parts = parts.max(1).min(items.len().max(1));
    let base = items.len() / parts;
    let extra = items.len() % parts;

    let mut batches = Vec::with_capacity(parts);
    let mut iter = items.into_iter();
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        let batch: Vec<A> = iter.by_ref().take(len).collect();
        if !batch.is_empty() {
            batches.push(batch);
        }
    }
    batches
}

/// Shuffle: gather mapped values under their key, keeping arrival order
fn group_by_key<K: Ord, M>(mapped: Vec<Vec<(K, M)>>) -> BTreeMap<K, Vec<M>> {
    let mut groups: BTreeMap<K, Vec<M>> = BTreeMap::new();
    for (key, value) in mapped.into_iter().flatten() {
        groups.entry(key).or_default().push(value);
    }
    groups
}

impl Dispatcher {
    /// Run `f` on every item, one child coroutine per item.
    ///
    /// The returned future yields the results in input order, or the first
    /// error once every child finished.
    pub fn for_each<A, B, F, Fut>(&self, items: Vec<A>, f: F) -> Result<Future<Vec<B>>>
    where
        A: Send + 'static,
        B: Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: StdFuture<Output = Result<B>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.post(move |ctx| async move {
            let mut children = Vec::with_capacity(items.len());
            for item in items {
                let f = f.clone();
                children.push(ctx.post(move |child| (*f)(child, item))?);
            }
            ctx.wait_all(children).await
        })
    }

    /// Like [`Dispatcher::for_each`] but with one child per coroutine thread,
    /// each processing a contiguous batch sequentially.
    pub fn for_each_batch<A, B, F, Fut>(&self, items: Vec<A>, f: F) -> Result<Future<Vec<Vec<B>>>>
    where
        A: Send + 'static,
        B: Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: StdFuture<Output = Result<B>> + Send + 'static,
    {
        let f = Arc::new(f);
        let parts = self.coro_thread_count();
        self.post(move |ctx| async move {
            let mut children = Vec::new();
            for batch in split_batches(items, parts) {
                let f = f.clone();
                children.push(ctx.post(move |child| async move {
                    let mut out = Vec::with_capacity(batch.len());
                    for item in batch {
                        out.push((*f)(child.clone(), item).await?);
                    }
                    Ok::<_, Error>(out)
                })?);
            }
            ctx.wait_all(children).await
        })
    }

    /// Map every item to key/value pairs, group the values by key, then
    /// reduce each group.
    ///
    /// Each item is mapped in its own coroutine and each key is reduced in
    /// its own coroutine.
    pub fn map_reduce<A, K, M, R, MF, RF>(
        &self,
        items: Vec<A>,
        mapper: MF,
        reducer: RF,
    ) -> Result<Future<BTreeMap<K, R>>>
    where
        A: Send + 'static,
        K: Ord + Send + 'static,
        M: Send + 'static,
        R: Send + 'static,
        MF: Fn(A) -> Vec<(K, M)> + Send + Sync + 'static,
        RF: Fn(&K, Vec<M>) -> R + Send + Sync + 'static,
    {
        let mapper = Arc::new(mapper);
        let reducer = Arc::new(reducer);

        self.post(move |ctx| async move {
            let mut mapping = Vec::with_capacity(items.len());
            for item in items {
                let mapper = mapper.clone();
                mapping.push(ctx.post(move |_| async move { Ok::<_, Error>((*mapper)(item)) })?);
            }
            let groups = group_by_key(ctx.wait_all(mapping).await?);

            let mut reducing = Vec::with_capacity(groups.len());
            for (key, values) in groups {
                let reducer = reducer.clone();
                reducing.push(ctx.post(move |_| async move {
                    let reduced = (*reducer)(&key, values);
                    Ok::<_, Error>((key, reduced))
                })?);
            }
            Ok(ctx.wait_all(reducing).await?.into_iter().collect())
        })
    }

    /// Like [`Dispatcher::map_reduce`] but both phases run one child per
    /// coroutine thread, each handling a contiguous batch of items (map) or
    /// keys (reduce).
    pub fn map_reduce_batch<A, K, M, R, MF, RF>(
        &self,
        items: Vec<A>,
        mapper: MF,
        reducer: RF,
    ) -> Result<Future<BTreeMap<K, R>>>
    where
        A: Send + 'static,
        K: Ord + Send + 'static,
        M: Send + 'static,
        R: Send + 'static,
        MF: Fn(A) -> Vec<(K, M)> + Send + Sync + 'static,
        RF: Fn(&K, Vec<M>) -> R + Send + Sync + 'static,
    {
        let mapper = Arc::new(mapper);
        let reducer = Arc::new(reducer);
        let parts = self.coro_thread_count();

        self.post(move |ctx| async move {
            let mut mapping = Vec::new();
            for batch in split_batches(items, parts) {
                let mapper = mapper.clone();
                mapping.push(ctx.post(move |_| async move {
                    Ok::<_, Error>(batch.into_iter().flat_map(|a| (*mapper)(a)).collect::<Vec<_>>())
                })?);
            }
            let groups = group_by_key(ctx.wait_all(mapping).await?);

            let mut reducing = Vec::new();
            for batch in split_batches(groups.into_iter().collect(), parts) {
                let reducer = reducer.clone();
                reducing.push(ctx.post(move |_| async move {
                    Ok::<_, Error>(
                        batch
                            .into_iter()
                            .map(|(key, values)| {
                                let reduced = (*reducer)(&key, values);
                                (key, reduced)
                            })
                            .collect::<Vec<_>>(),
                    )
                })?);
            }
            Ok(ctx.wait_all(reducing).await?.into_iter().flatten().collect())
        })
    }
}
