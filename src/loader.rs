use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
    cache::{CacheMap, ValueCache},
    combine::{combine, Combine, PromisedValues},
    data::{BatchEnvironment, BatchLoader, Context, ContextProvider},
    dispatch::{DispatchStrategy, StrategyHook},
    error::LoadError,
    options::{CacheKeyFn, LoaderOptions, LoaderSettings},
    promise::{Driver, LoadFuture, LoadResult},
    stats::{Statistics, StatisticsCollector},
};

/// A load waiting for the next dispatch.
struct QueueEntry<K, V, E> {
    key: K,
    handle: LoadFuture<V, E>,
    context: Option<Context>,
}

/// Everything guarded by the loader's lock: the pending queue and the
/// promise tier. Checking the cache and queueing a key happen under one
/// acquisition, as do draining and clearing the queue, so every load lands
/// in exactly one dispatch.
struct LoaderState<K, V, E> {
    queue: Vec<QueueEntry<K, V, E>>,
    cache: Box<dyn CacheMap<K, V, E>>,
    last_dispatch: Instant,
}

struct LoaderInner<K, V, E> {
    batcher: BatchLoader<K, V, E>,
    settings: LoaderSettings,
    cache_key: Option<CacheKeyFn<K>>,
    value_cache: Arc<dyn ValueCache<K, V>>,
    statistics: Arc<dyn StatisticsCollector>,
    context_provider: Option<ContextProvider>,
    strategy: ArcSwapOption<StrategyHook>,
    state: Mutex<LoaderState<K, V, E>>,
}

/// A request-coalescing loader.
///
/// Each call to [`load`](DataLoader::load) registers interest in a key and
/// returns a [`LoadFuture`] for it. Nothing is fetched until
/// [`dispatch`](DataLoader::dispatch) is called (directly, through a
/// [`DataLoaderRegistry`](crate::DataLoaderRegistry), or automatically by a
/// dispatch strategy). Dispatch collects every queued key into one call to
/// the batch function (or several, if `max_batch_size` is set), then hands
/// each caller its own key's result.
///
/// With caching enabled (the default), a key's handle is kept in the
/// promise tier across dispatches, so loading the same key again returns the
/// same handle without calling the batch function. Failed keys are cached
/// too, unless `caching_exceptions_enabled` is turned off.
///
/// `DataLoader` is a cheap, shareable handle; clones share all state.
pub struct DataLoader<K, V, E> {
    inner: Arc<LoaderInner<K, V, E>>,
}

impl<K, V, E> Clone for DataLoader<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, E> Debug for DataLoader<K, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoader")
            .field("settings", &self.inner.settings)
            .field("batcher", &self.inner.batcher)
            .field("statistics", &self.inner.statistics)
            .finish()
    }
}

impl<K, V, E> DataLoader<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(batcher: BatchLoader<K, V, E>) -> Self {
        Self::with_options(batcher, LoaderOptions::default())
    }

    /// A loader for a plain list batch function, with default options.
    pub fn from_fn<F, Fut>(batcher: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>, E>> + Send + 'static,
    {
        Self::new(BatchLoader::list(batcher))
    }

    pub fn with_options(batcher: BatchLoader<K, V, E>, options: LoaderOptions<K, V, E>) -> Self {
        let options = options.resolve();

        Self {
            inner: Arc::new(LoaderInner {
                batcher,
                settings: options.settings,
                cache_key: options.cache_key,
                value_cache: options.value_cache,
                statistics: options.statistics,
                context_provider: options.context_provider,
                strategy: ArcSwapOption::empty(),
                state: Mutex::new(LoaderState {
                    queue: Vec::new(),
                    cache: options.cache_map,
                    last_dispatch: Instant::now(),
                }),
            }),
        }
    }

    /// Request the value for `key`. See [`load_with_context`].
    ///
    /// [`load_with_context`]: DataLoader::load_with_context
    pub fn load(&self, key: K) -> LoadFuture<V, E> {
        self.load_with_context(key, None)
    }

    /// Request the value for `key`, attaching a per-load context that the
    /// batch function can read from its [`BatchEnvironment`].
    ///
    /// If the key is already in the promise tier, its existing handle is
    /// returned. Otherwise the key is queued for the next dispatch (or, with
    /// batching disabled, loaded on its own right away) and the new handle is
    /// cached before this returns, so concurrent loads of the same key share
    /// it.
    pub fn load_with_context(&self, key: K, context: Option<Context>) -> LoadFuture<V, E> {
        let inner = &*self.inner;
        let settings = inner.settings;
        inner.statistics.increment_load_count();

        let (handle, immediate) = {
            let mut state = inner.state.lock();

            let cache_key = match settings.caching_enabled {
                true => Some(inner.cache_key(&key)),
                false => None,
            };

            if let Some(cached) = cache_key.as_ref().and_then(|ck| state.cache.get(ck)) {
                drop(state);
                inner.statistics.increment_cache_hit_count();
                trace!("promise cache hit");
                return cached;
            }

            let handle = LoadFuture::pending();
            let immediate = match settings.batching_enabled {
                true => {
                    state.queue.push(QueueEntry {
                        key,
                        handle: handle.clone(),
                        context,
                    });
                    None
                }
                false => Some((key, context)),
            };

            if let Some(cache_key) = cache_key {
                state.cache.set(cache_key, handle.clone());
            }

            (handle, immediate)
        };

        // Batching is off: this key is its own batch. The batch function
        // still runs outside the lock, and its result goes through the same
        // unwrapping as a dispatched batch.
        match immediate {
            Some((key, context)) => {
                inner.statistics.increment_batch_load_count_by(1);
                let batch = self
                    .inner
                    .clone()
                    .load_batch(vec![key], vec![context], vec![handle.clone()]);
                handle.attach_driver(&self.inner.clone().driver(batch));
            }
            None => self.notify_strategy(),
        }

        handle
    }

    /// Load several keys. The combined future completes when every key has
    /// a result, and reports each key's outcome at its position.
    pub fn load_many(&self, keys: impl IntoIterator<Item = K>) -> Combine<LoadFuture<V, E>> {
        combine(keys.into_iter().map(|key| self.load(key)).collect::<Vec<_>>())
    }

    /// Load several keys with per-load contexts. Keys without a matching
    /// context are loaded without one.
    pub fn load_many_with_contexts(
        &self,
        keys: impl IntoIterator<Item = K>,
        contexts: impl IntoIterator<Item = Option<Context>>,
    ) -> Combine<LoadFuture<V, E>> {
        let mut contexts = contexts.into_iter();
        combine(
            keys.into_iter()
                .map(|key| self.load_with_context(key, contexts.next().flatten()))
                .collect::<Vec<_>>(),
        )
    }

    /// Send every queued key to the batch function.
    ///
    /// The queue is drained atomically; loads that race with this call land
    /// either in this dispatch or the next one. The batch calls run when the
    /// returned [`DispatchResult`], or any handle of a dispatched key, is
    /// polled.
    pub fn dispatch(&self) -> DispatchResult<V, E> {
        let inner = &self.inner;

        let entries = {
            let mut state = inner.state.lock();
            state.last_dispatch = Instant::now();
            mem::take(&mut state.queue)
        };

        if !inner.settings.batching_enabled || entries.is_empty() {
            return DispatchResult::empty();
        }

        let key_count = entries.len();
        let mut keys = Vec::with_capacity(key_count);
        let mut handles = Vec::with_capacity(key_count);
        let mut contexts = Vec::with_capacity(key_count);
        for entry in entries {
            keys.push(entry.key);
            handles.push(entry.handle);
            contexts.push(entry.context);
        }

        let batches: Vec<BoxFuture<'static, ()>> = match inner.settings.max_batch_size {
            Some(max) if key_count > max.get() => {
                debug!(
                    keys = key_count,
                    max_batch_size = max.get(),
                    "splitting dispatch into {} batches",
                    (key_count + max.get() - 1) / max.get()
                );

                keys.chunks(max.get())
                    .zip(contexts.chunks(max.get()))
                    .zip(handles.chunks(max.get()))
                    .map(|((keys, contexts), handles)| {
                        inner.statistics.increment_batch_load_count_by(keys.len() as u64);
                        inner
                            .clone()
                            .load_batch(keys.to_vec(), contexts.to_vec(), handles.to_vec())
                    })
                    .collect()
            }
            _ => {
                debug!(keys = key_count, "dispatching batch");
                inner.statistics.increment_batch_load_count_by(key_count as u64);
                vec![inner.clone().load_batch(keys, contexts, handles.clone())]
            }
        };

        // Sub-batches are independent and run concurrently; one failing
        // doesn't affect the others.
        let job = inner
            .clone()
            .driver(future::join_all(batches).map(drop).boxed());

        handles.iter().for_each(|handle| handle.attach_driver(&job));

        DispatchResult {
            key_count,
            values: combine(handles),
        }
    }

    /// Dispatch and block until every dispatched key has a result.
    pub fn dispatch_and_join(&self) -> PromisedValues<V, LoadError<E>> {
        self.dispatch().join()
    }

    /// The cached handle for `key`, if caching is enabled and it is cached.
    pub fn get_if_present(&self, key: &K) -> Option<LoadFuture<V, E>> {
        if !self.inner.settings.caching_enabled {
            return None;
        }

        let cache_key = self.inner.cache_key(key);
        self.inner.state.lock().cache.get(&cache_key)
    }

    /// Like [`get_if_present`](DataLoader::get_if_present), but only if the
    /// cached handle already has its result. A batch function can use this
    /// to peek at another loader without waiting on it.
    pub fn get_if_completed(&self, key: &K) -> Option<LoadFuture<V, E>> {
        self.get_if_present(key).filter(LoadFuture::is_done)
    }

    /// Remove `key` from the promise tier immediately. The returned future
    /// removes it from the value tier; value-tier failures are ignored.
    /// Queued, undispatched loads of `key` are unaffected.
    pub fn clear(&self, key: &K) -> BoxFuture<'static, ()> {
        let cache_key = self.inner.cache_key(key);
        self.inner.state.lock().cache.delete(&cache_key);

        self.inner.value_cache.delete(key).map(|_| ()).boxed()
    }

    /// Empty the promise tier immediately. The returned future clears the
    /// value tier; value-tier failures are ignored.
    pub fn clear_all(&self) -> BoxFuture<'static, ()> {
        self.inner.state.lock().cache.clear();

        self.inner.value_cache.clear().map(|_| ()).boxed()
    }

    /// Cache `value` for `key`, unless the key is already cached.
    pub fn prime(&self, key: K, value: V) -> &Self {
        self.prime_result(key, Ok(value));
        self
    }

    /// Cache a failure for `key`, unless the key is already cached.
    pub fn prime_error(&self, key: K, error: E) -> &Self {
        self.prime_result(key, Err(LoadError::Load(error)));
        self
    }

    /// Like [`prime`](DataLoader::prime), but also write the value to the
    /// value tier if it was installed. The returned future performs that
    /// write.
    pub fn prime_and_store(&self, key: K, value: V) -> BoxFuture<'static, ()> {
        match self.prime_result(key.clone(), Ok(value.clone())) {
            true => self.inner.value_cache.set(&key, &value).map(|_| ()).boxed(),
            false => future::ready(()).boxed(),
        }
    }

    fn prime_result(&self, key: K, result: LoadResult<V, E>) -> bool {
        let cache_key = self.inner.cache_key(&key);
        let primed = LoadFuture::ready(result);

        let cached = self.inner.state.lock().cache.set_if_absent(cache_key, primed.clone());
        cached.ptr_eq(&primed)
    }

    /// The number of loads waiting for the next dispatch.
    pub fn dispatch_depth(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// The promise-tier key for `key`.
    pub fn cache_key(&self, key: &K) -> K {
        self.inner.cache_key(key)
    }

    pub fn statistics(&self) -> Statistics {
        self.inner.statistics.statistics()
    }

    pub fn settings(&self) -> LoaderSettings {
        self.inner.settings
    }

    /// When `dispatch` was last called (or the loader was created).
    pub fn last_dispatch_time(&self) -> Instant {
        self.inner.state.lock().last_dispatch
    }

    pub fn time_since_dispatch(&self) -> Duration {
        self.last_dispatch_time().elapsed()
    }

    pub(crate) fn attach_strategy(&self, strategy: Arc<dyn DispatchStrategy>) {
        self.inner
            .strategy
            .store(Some(Arc::new(StrategyHook::new(strategy))));
    }

    /// Stop reporting to `strategy`. A hook for any other strategy is kept.
    pub(crate) fn detach_strategy(&self, strategy: &Arc<dyn DispatchStrategy>) {
        self.inner.strategy.rcu(|current| match current {
            Some(hook) if hook.is(strategy) => None,
            other => other.clone(),
        });
    }

    fn notify_strategy(&self) {
        if let Some(hook) = self.inner.strategy.load_full() {
            hook.load_called();
        }
    }
}

impl<K, V, E> LoaderInner<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Share `batch` between the handles it completes. Each poll is reported
    /// to the dispatch strategy, so that loads the batch functions make are
    /// dispatched together afterwards.
    fn driver(self: Arc<Self>, mut batch: BoxFuture<'static, ()>) -> Driver {
        future::poll_fn(move |ctx| {
            let _poll = self.strategy.load_full().map(|hook| hook.batch_poll());
            batch.poll_unpin(ctx)
        })
        .boxed()
        .shared()
    }

    fn cache_key(&self, key: &K) -> K {
        match self.cache_key {
            Some(ref cache_key) => cache_key(key),
            None => key.clone(),
        }
    }

    /// Resolve one batch worth of keys: first from the value tier (if
    /// caching is on), then from the batch function for whatever missed.
    fn load_batch(
        self: Arc<Self>,
        keys: Vec<K>,
        contexts: Vec<Option<Context>>,
        handles: Vec<LoadFuture<V, E>>,
    ) -> BoxFuture<'static, ()> {
        async move {
            if !self.settings.caching_enabled {
                return self.invoke_batcher(keys, contexts, handles).await;
            }

            let missed: Vec<usize> = match self.value_cache.get_values(&keys).await {
                Ok(cached) if cached.len() == keys.len() => cached
                    .into_iter()
                    .zip(handles.iter())
                    .enumerate()
                    .filter_map(|(idx, (cached, handle))| match cached {
                        Ok(value) => {
                            trace!("value cache hit");
                            handle.complete(Ok(value));
                            None
                        }
                        Err(..) => Some(idx),
                    })
                    .collect(),
                Ok(cached) => {
                    warn!(
                        expected = keys.len(),
                        actual = cached.len(),
                        "value cache returned the wrong number of values; ignoring it"
                    );
                    (0..keys.len()).collect()
                }
                Err(..) => (0..keys.len()).collect(),
            };

            if missed.is_empty() {
                return;
            }

            if missed.len() == keys.len() {
                return self.invoke_batcher(keys, contexts, handles).await;
            }

            let keys = missed.iter().map(|&idx| keys[idx].clone()).collect();
            let contexts = missed.iter().map(|&idx| contexts[idx].clone()).collect();
            let handles = missed.iter().map(|&idx| handles[idx].clone()).collect();
            self.invoke_batcher(keys, contexts, handles).await
        }
        .boxed()
    }

    async fn invoke_batcher(
        self: Arc<Self>,
        keys: Vec<K>,
        contexts: Vec<Option<Context>>,
        handles: Vec<LoadFuture<V, E>>,
    ) {
        let context = self.context_provider.as_ref().and_then(|provider| provider());
        let env = BatchEnvironment::new(context, &keys, &contexts);

        self.statistics.increment_batch_invoke_count();
        let values = match self.batcher.call(keys.clone(), env).await {
            Ok(values) => values,
            Err(err) => {
                warn!(keys = keys.len(), "batch function failed");
                self.statistics.increment_batch_load_exception_count();
                return self.fail_batch(&keys, &handles, LoadError::Load(err));
            }
        };

        if values.len() != keys.len() {
            error!(
                expected = keys.len(),
                actual = values.len(),
                "batch function broke its contract: the number of values must match the number of keys"
            );
            self.statistics.increment_batch_load_exception_count();
            return self.fail_batch(
                &keys,
                &handles,
                LoadError::ResultSizeMismatch {
                    expected: keys.len(),
                    actual: values.len(),
                },
            );
        }

        let caching = self.settings.caching_enabled;
        let mut results = Vec::with_capacity(values.len());
        let mut failed_keys = Vec::new();
        let mut failed_handles = Vec::new();
        let mut stored_keys = Vec::new();
        let mut stored_values = Vec::new();

        for ((key, handle), value) in keys.into_iter().zip(handles.iter()).zip(values) {
            match value {
                Ok(value) => {
                    if caching {
                        stored_keys.push(key);
                        stored_values.push(value.clone());
                    }
                    results.push(Ok(value));
                }
                Err(err) => {
                    self.statistics.increment_load_error_count();
                    failed_keys.push(key);
                    failed_handles.push(handle.clone());
                    results.push(Err(LoadError::Load(err)));
                }
            }
        }

        if !self.settings.caching_exceptions_enabled {
            self.evict(&failed_keys, &failed_handles);
        }

        let store = caching && !stored_keys.is_empty();
        let complete_after_set = self.settings.value_cache_options.complete_value_after_cache_set;

        if store && complete_after_set {
            let _ = self.value_cache.set_values(&stored_keys, &stored_values).await;
        }

        for (handle, result) in handles.iter().zip(results) {
            handle.complete(result);
        }

        if store && !complete_after_set {
            let _ = self.value_cache.set_values(&stored_keys, &stored_values).await;
        }
    }

    /// The batch call failed as a whole: nothing was individually
    /// evaluated, so every key is evicted regardless of settings, and every
    /// handle fails with the same cause.
    fn fail_batch(&self, keys: &[K], handles: &[LoadFuture<V, E>], err: LoadError<E>) {
        self.evict(keys, handles);
        for handle in handles {
            handle.complete(Err(err.clone()));
        }
    }

    /// Remove keys from the promise tier, but only where the cached handle is
    /// still the one from this batch; a key that was cleared and reloaded in
    /// the meantime keeps its newer entry.
    fn evict(&self, keys: &[K], handles: &[LoadFuture<V, E>]) {
        if keys.is_empty() || !self.settings.caching_enabled {
            return;
        }

        let cache_keys: Vec<K> = keys.iter().map(|key| self.cache_key(key)).collect();
        let mut state = self.state.lock();

        for (cache_key, handle) in cache_keys.iter().zip(handles) {
            let current = state
                .cache
                .get(cache_key)
                .map_or(false, |cached| cached.ptr_eq(handle));

            if current {
                state.cache.delete(cache_key);
            }
        }
    }
}

/// The outcome of one [`dispatch`](DataLoader::dispatch).
///
/// Awaiting it drives the dispatched batch calls and yields every
/// dispatched key's result, in the order the keys were loaded. Failed keys
/// are reported in place rather than failing the whole result.
#[must_use = "a dispatch's batch calls run when its result or one of its handles is polled"]
pub struct DispatchResult<V: Clone, E: Clone> {
    key_count: usize,
    values: Combine<LoadFuture<V, E>>,
}

impl<V: Clone, E: Clone> DispatchResult<V, E> {
    fn empty() -> Self {
        Self {
            key_count: 0,
            values: combine(Vec::new()),
        }
    }

    /// The number of queued loads this dispatch handled.
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    /// Block the current thread until every dispatched key has a result.
    pub fn join(self) -> PromisedValues<V, LoadError<E>> {
        futures::executor::block_on(self)
    }
}

impl<V: Clone, E: Clone> Debug for DispatchResult<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchResult")
            .field("key_count", &self.key_count)
            .field("values", &self.values)
            .finish()
    }
}

impl<V: Clone, E: Clone> Future for DispatchResult<V, E> {
    type Output = PromisedValues<V, LoadError<E>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.get_mut().values.poll_unpin(ctx)
    }
}
