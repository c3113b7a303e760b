//! Data structures for passing keys into, and results out of, a batch
//! function.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};

/// An opaque, caller-supplied value. Used both for the per-load context
/// passed to `load_with_context` and for the global batch context.
pub type Context = Arc<dyn Any + Send + Sync>;

/// The result of one batch function call: either a whole-batch failure, or
/// one outcome per key, aligned with the keys the function was given.
pub type BatchResult<V, E> = Result<Vec<Result<V, E>>, E>;

/// Supplies the global context handed to every batch call.
pub type ContextProvider = Arc<dyn Fn() -> Option<Context> + Send + Sync>;

/// Everything a context-aware batch function gets besides its keys.
///
/// Per-key contexts are available both by key and by position. The two
/// views diverge when the same key was loaded more than once with different
/// contexts (possible when caching is disabled): the map keeps the last
/// context given for a key, while the list keeps every one.
pub struct BatchEnvironment<K> {
    context: Option<Context>,
    key_contexts: HashMap<K, Context>,
    key_contexts_list: Vec<Option<Context>>,
}

impl<K: Eq + Hash + Clone> BatchEnvironment<K> {
    pub(crate) fn new(
        context: Option<Context>,
        keys: &[K],
        contexts: &[Option<Context>],
    ) -> Self {
        let key_contexts = keys
            .iter()
            .zip(contexts)
            .filter_map(|(key, context)| Some((key.clone(), context.clone()?)))
            .collect();

        Self {
            context,
            key_contexts,
            key_contexts_list: contexts.to_vec(),
        }
    }
}

impl<K: Eq + Hash> BatchEnvironment<K> {
    /// The global context, if a provider was configured and produced one.
    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// The global context, downcast to `T`.
    pub fn context_as<T: Any>(&self) -> Option<&T> {
        self.context.as_deref()?.downcast_ref()
    }

    pub fn key_contexts(&self) -> &HashMap<K, Context> {
        &self.key_contexts
    }

    /// The context given with the last load of `key`, downcast to `T`.
    pub fn key_context_as<T: Any>(&self, key: &K) -> Option<&T> {
        self.key_contexts.get(key)?.downcast_ref()
    }

    /// Per-load contexts, aligned with the batch's keys.
    pub fn key_contexts_list(&self) -> &[Option<Context>] {
        &self.key_contexts_list
    }
}

impl<K: Debug> Debug for BatchEnvironment<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchEnvironment")
            .field("has_context", &self.context.is_some())
            .field("context_keys", &self.key_contexts.keys().collect::<Vec<_>>())
            .field("key_contexts_list_len", &self.key_contexts_list.len())
            .finish()
    }
}

type BatchFn<K, V, E> =
    dyn Fn(Vec<K>, BatchEnvironment<K>) -> BoxFuture<'static, BatchResult<V, E>> + Send + Sync;

/// A batch function, adapted from one of several closure shapes into the
/// single call shape a loader uses.
///
/// List shapes must return exactly one outcome per key, in the order the
/// keys were given; returning a different number of values fails every key
/// in the call with `LoadError::ResultSizeMismatch`.
pub struct BatchLoader<K, V, E> {
    call: Arc<BatchFn<K, V, E>>,
}

impl<K, V, E> Clone for BatchLoader<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            call: self.call.clone(),
        }
    }
}

impl<K, V, E> Debug for BatchLoader<K, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchLoader")
            .field("call", &"<closure>")
            .finish()
    }
}

impl<K, V, E> BatchLoader<K, V, E>
where
    K: Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    /// A context-aware batch function with per-key outcomes. Every other
    /// shape is expressed in terms of this one.
    pub fn with_environment<F, Fut>(batcher: F) -> Self
    where
        F: Fn(Vec<K>, BatchEnvironment<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult<V, E>> + Send + 'static,
    {
        Self {
            call: Arc::new(move |keys: Vec<K>, env: BatchEnvironment<K>| {
                batcher(keys, env).boxed()
            }),
        }
    }

    /// A batch function whose values all succeed, unless the whole call
    /// fails.
    pub fn list<F, Fut>(batcher: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>, E>> + Send + 'static,
    {
        Self::with_environment(move |keys, _env| {
            batcher(keys).map(|result| {
                result.map(|values| values.into_iter().map(Ok).collect::<Vec<_>>())
            })
        })
    }

    /// A batch function that can fail individual keys.
    pub fn try_list<F, Fut>(batcher: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult<V, E>> + Send + 'static,
    {
        Self::with_environment(move |keys, _env| batcher(keys))
    }

    pub(crate) fn call(
        &self,
        keys: Vec<K>,
        env: BatchEnvironment<K>,
    ) -> BoxFuture<'static, BatchResult<V, E>> {
        (self.call)(keys, env)
    }
}

impl<K, V, E> BatchLoader<K, Option<V>, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    /// A batch function that returns a map instead of a list. It receives
    /// each distinct key once, in first-occurrence order, and keys missing
    /// from the map resolve to `None`.
    pub fn mapped<F, Fut>(batcher: F) -> Self
    where
        F: Fn(Vec<K>, BatchEnvironment<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<K, V>, E>> + Send + 'static,
        V: Clone,
    {
        Self::with_environment(move |keys: Vec<K>, env| {
            let unique: Vec<K> = {
                let mut seen = HashSet::with_capacity(keys.len());
                keys.iter()
                    .filter(|key| seen.insert(*key))
                    .cloned()
                    .collect()
            };

            batcher(unique, env).map(move |result| -> BatchResult<Option<V>, E> {
                let found = result?;
                Ok(keys.iter().map(|key| Ok(found.get(key).cloned())).collect())
            })
        })
    }
}
