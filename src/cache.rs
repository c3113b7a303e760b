//! The two cache tiers a loader consults.
//!
//! The promise tier ([`CacheMap`]) is synchronous and always consulted first.
//! It maps a cache key to the [`LoadFuture`] for that key, whether still in
//! flight or already complete, and it is only ever touched while the owning
//! loader holds its lock.
//!
//! The value tier ([`ValueCache`]) is optional, asynchronous and typically
//! external. It holds completed values only, and is consulted at dispatch
//! time for keys that missed the promise tier. Every value-tier failure is
//! treated as a miss.

use std::{collections::HashMap, fmt::Debug, hash::Hash};

use futures::{
    future::{self, BoxFuture},
    FutureExt,
};

use crate::{combine::combine, error::ValueCacheError, promise::LoadFuture};

/// The in-process promise tier.
pub trait CacheMap<K, V, E>: Send {
    fn contains_key(&self, key: &K) -> bool;

    fn get(&self, key: &K) -> Option<LoadFuture<V, E>>;

    /// Insert `value` unless `key` is already present. Returns the handle
    /// now cached under `key`.
    fn set_if_absent(&mut self, key: K, value: LoadFuture<V, E>) -> LoadFuture<V, E>;

    fn set(&mut self, key: K, value: LoadFuture<V, E>);

    fn delete(&mut self, key: &K);

    fn clear(&mut self);
}

/// The default promise tier: a plain `HashMap`.
pub struct DefaultCacheMap<K, V, E> {
    map: HashMap<K, LoadFuture<V, E>>,
}

impl<K, V, E> Default for DefaultCacheMap<K, V, E> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<K: Debug, V, E> Debug for DefaultCacheMap<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

impl<K, V, E> CacheMap<K, V, E> for DefaultCacheMap<K, V, E>
where
    K: Eq + Hash + Send,
    V: Send,
    E: Send,
{
    fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn get(&self, key: &K) -> Option<LoadFuture<V, E>> {
        self.map.get(key).cloned()
    }

    fn set_if_absent(&mut self, key: K, value: LoadFuture<V, E>) -> LoadFuture<V, E> {
        self.map.entry(key).or_insert(value).clone()
    }

    fn set(&mut self, key: K, value: LoadFuture<V, E>) {
        self.map.insert(key, value);
    }

    fn delete(&mut self, key: &K) {
        self.map.remove(key);
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

/// Per-key outcomes of a batch value-tier lookup.
pub type CachedValues<V> = Vec<Result<V, ValueCacheError>>;

/// The optional, asynchronous value tier.
///
/// Returned futures must be `'static`; implementations clone whatever they
/// need out of the key and value. Returning [`ValueCacheError::NotSupported`]
/// from the batch methods makes the loader skip the tier entirely for that
/// call.
pub trait ValueCache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> BoxFuture<'static, Result<V, ValueCacheError>>;

    fn set(&self, key: &K, value: &V) -> BoxFuture<'static, Result<(), ValueCacheError>>;

    fn delete(&self, key: &K) -> BoxFuture<'static, Result<(), ValueCacheError>>;

    fn clear(&self) -> BoxFuture<'static, Result<(), ValueCacheError>>;

    /// Look up several keys at once. The result must be aligned with `keys`.
    /// By default this calls `get` for each key, concurrently.
    fn get_values(
        &self,
        keys: &[K],
    ) -> BoxFuture<'static, Result<CachedValues<V>, ValueCacheError>>
    where
        V: Send + 'static,
    {
        combine(keys.iter().map(|key| self.get(key)))
            .map(|values| Ok(values.into_results()))
            .boxed()
    }

    /// Store several values at once. By default this calls `set` for each
    /// pair, concurrently, and ignores individual failures.
    fn set_values(
        &self,
        keys: &[K],
        values: &[V],
    ) -> BoxFuture<'static, Result<(), ValueCacheError>> {
        let sets: Vec<_> = keys
            .iter()
            .zip(values)
            .map(|(key, value)| self.set(key, value))
            .collect();

        combine(sets).map(|_| Ok(())).boxed()
    }
}

/// A value tier that stores nothing. This is the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpValueCache;

impl<K, V: Send + 'static> ValueCache<K, V> for NoOpValueCache {
    fn get(&self, _key: &K) -> BoxFuture<'static, Result<V, ValueCacheError>> {
        future::ready(Err(ValueCacheError::Miss)).boxed()
    }

    fn set(&self, _key: &K, _value: &V) -> BoxFuture<'static, Result<(), ValueCacheError>> {
        future::ready(Err(ValueCacheError::NotSupported)).boxed()
    }

    fn delete(&self, _key: &K) -> BoxFuture<'static, Result<(), ValueCacheError>> {
        future::ready(Ok(())).boxed()
    }

    fn clear(&self) -> BoxFuture<'static, Result<(), ValueCacheError>> {
        future::ready(Ok(())).boxed()
    }

    fn get_values(
        &self,
        _keys: &[K],
    ) -> BoxFuture<'static, Result<CachedValues<V>, ValueCacheError>> {
        future::ready(Err(ValueCacheError::NotSupported)).boxed()
    }

    fn set_values(
        &self,
        _keys: &[K],
        _values: &[V],
    ) -> BoxFuture<'static, Result<(), ValueCacheError>> {
        future::ready(Err(ValueCacheError::NotSupported)).boxed()
    }
}

/// Controls how a loader writes back to its value tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueCacheOptions {
    /// If true, a batch's handles complete only after the value tier has
    /// accepted (or rejected) the new values. If false, they complete first
    /// and the write follows.
    pub complete_value_after_cache_set: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor;

    #[test]
    fn set_if_absent_keeps_first() {
        let mut cache = DefaultCacheMap::<&str, u32, ()>::default();
        let first = LoadFuture::ready(Ok(1));

        let cached = cache.set_if_absent("a", first.clone());
        assert!(cached.ptr_eq(&first));

        let cached = cache.set_if_absent("a", LoadFuture::ready(Ok(2)));
        assert!(cached.ptr_eq(&first));

        cache.delete(&"a");
        assert!(!cache.contains_key(&"a"));
    }

    #[test]
    fn noop_value_cache_never_hits() {
        let cache = NoOpValueCache;
        let get = ValueCache::<u32, u32>::get(&cache, &1);
        assert_eq!(executor::block_on(get), Err(ValueCacheError::Miss));

        let many = ValueCache::<u32, u32>::get_values(&cache, &[1, 2]);
        assert_eq!(executor::block_on(many), Err(ValueCacheError::NotSupported));
    }
}
