use std::{
    fmt::{self, Debug, Formatter},
    hash::Hash,
    num::NonZeroUsize,
    sync::Arc,
};

use crate::{
    cache::{CacheMap, DefaultCacheMap, NoOpValueCache, ValueCache, ValueCacheOptions},
    data::{Context, ContextProvider},
    stats::{SimpleStatisticsCollector, StatisticsCollector},
};

/// Maps a key to the key actually used in the promise tier. Keys that map
/// to the same cache key share one cached result.
pub type CacheKeyFn<K> = Arc<dyn Fn(&K) -> K + Send + Sync>;

/// The configuration for a [`DataLoader`](crate::DataLoader).
///
/// Defaults: batching and caching on, failures cached like values, no batch
/// size limit, identity cache keys, an in-memory promise tier, no value
/// tier, and simple atomic statistics.
pub struct LoaderOptions<K, V, E> {
    /// If false, every `load` calls the batch function immediately with a
    /// single key, and `dispatch` does nothing.
    pub batching_enabled: bool,

    /// If false, nothing is cached and every `load` is queued, duplicates
    /// included.
    pub caching_enabled: bool,

    /// If false, keys whose individual result was an error are evicted from
    /// the promise tier after their batch, so the next `load` retries them.
    pub caching_exceptions_enabled: bool,

    /// Larger dispatches are split into several batch calls of at most this
    /// many keys.
    pub max_batch_size: Option<NonZeroUsize>,

    pub value_cache_options: ValueCacheOptions,

    pub(crate) cache_key: Option<CacheKeyFn<K>>,
    pub(crate) cache_map: Option<Box<dyn CacheMap<K, V, E>>>,
    pub(crate) value_cache: Option<Arc<dyn ValueCache<K, V>>>,
    pub(crate) statistics: Option<Arc<dyn StatisticsCollector>>,
    pub(crate) context_provider: Option<ContextProvider>,
}

impl<K, V, E> Default for LoaderOptions<K, V, E> {
    fn default() -> Self {
        Self {
            batching_enabled: true,
            caching_enabled: true,
            caching_exceptions_enabled: true,
            max_batch_size: None,
            value_cache_options: ValueCacheOptions::default(),
            cache_key: None,
            cache_map: None,
            value_cache: None,
            statistics: None,
            context_provider: None,
        }
    }
}

impl<K, V, E> LoaderOptions<K, V, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching_enabled = enabled;
        self
    }

    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.caching_enabled = enabled;
        self
    }

    pub fn with_caching_exceptions(mut self, enabled: bool) -> Self {
        self.caching_exceptions_enabled = enabled;
        self
    }

    /// Limit batch calls to `max` keys. Zero means no limit.
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = NonZeroUsize::new(max);
        self
    }

    pub fn with_cache_key(mut self, cache_key: impl Fn(&K) -> K + Send + Sync + 'static) -> Self {
        self.cache_key = Some(Arc::new(cache_key));
        self
    }

    pub fn with_cache_map(mut self, cache_map: impl CacheMap<K, V, E> + 'static) -> Self {
        self.cache_map = Some(Box::new(cache_map));
        self
    }

    pub fn with_value_cache(mut self, value_cache: Arc<dyn ValueCache<K, V>>) -> Self {
        self.value_cache = Some(value_cache);
        self
    }

    pub fn with_value_cache_options(mut self, options: ValueCacheOptions) -> Self {
        self.value_cache_options = options;
        self
    }

    pub fn with_statistics(mut self, statistics: Arc<dyn StatisticsCollector>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Supply the global context for every batch call. The provider is
    /// called once per batch call.
    pub fn with_context_provider(
        mut self,
        provider: impl Fn() -> Option<Context> + Send + Sync + 'static,
    ) -> Self {
        self.context_provider = Some(Arc::new(provider));
        self
    }
}

impl<K, V, E> LoaderOptions<K, V, E>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    /// Split the options into the plain settings and the collaborators,
    /// filling in defaults for anything not configured.
    pub(crate) fn resolve(self) -> ResolvedOptions<K, V, E> {
        ResolvedOptions {
            settings: LoaderSettings {
                batching_enabled: self.batching_enabled,
                caching_enabled: self.caching_enabled,
                caching_exceptions_enabled: self.caching_exceptions_enabled,
                max_batch_size: self.max_batch_size,
                value_cache_options: self.value_cache_options,
            },
            cache_key: self.cache_key,
            cache_map: self
                .cache_map
                .unwrap_or_else(|| Box::new(DefaultCacheMap::default())),
            value_cache: self.value_cache.unwrap_or_else(|| Arc::new(NoOpValueCache)),
            statistics: self
                .statistics
                .unwrap_or_else(|| Arc::new(SimpleStatisticsCollector::new())),
            context_provider: self.context_provider,
        }
    }
}

impl<K, V, E> Debug for LoaderOptions<K, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("batching_enabled", &self.batching_enabled)
            .field("caching_enabled", &self.caching_enabled)
            .field("caching_exceptions_enabled", &self.caching_exceptions_enabled)
            .field("max_batch_size", &self.max_batch_size)
            .field("value_cache_options", &self.value_cache_options)
            .field("cache_key", &self.cache_key.as_ref().map(|_| "<closure>"))
            .field("cache_map", &self.cache_map.as_ref().map(|_| "<custom>"))
            .field("value_cache", &self.value_cache.as_ref().map(|_| "<custom>"))
            .field("statistics", &self.statistics)
            .field("context_provider", &self.context_provider.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

/// The plain settings of a loader, which are fixed once it's built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderSettings {
    pub batching_enabled: bool,
    pub caching_enabled: bool,
    pub caching_exceptions_enabled: bool,
    pub max_batch_size: Option<NonZeroUsize>,
    pub value_cache_options: ValueCacheOptions,
}

pub(crate) struct ResolvedOptions<K, V, E> {
    pub settings: LoaderSettings,
    pub cache_key: Option<CacheKeyFn<K>>,
    pub cache_map: Box<dyn CacheMap<K, V, E>>,
    pub value_cache: Arc<dyn ValueCache<K, V>>,
    pub statistics: Arc<dyn StatisticsCollector>,
    pub context_provider: Option<ContextProvider>,
}
