//! Named collections of loaders, dispatched together.

use std::{
    any::Any,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use arc_swap::ArcSwap;
use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use tracing::debug;

use crate::{
    dispatch::{DispatchStrategy, NotBusyDispatchStrategy},
    loader::DataLoader,
    stats::Statistics,
};

/// The type-erased view of a loader that a registry needs.
pub(crate) trait Dispatchable: Send + Sync {
    /// Dispatch, leaving the batches to the dispatched handles. Returns the
    /// number of keys dispatched.
    fn dispatch_with(&self) -> usize;

    /// Dispatch, returning the key count and a job that drives the batches.
    fn dispatch_job(&self) -> (usize, BoxFuture<'static, ()>);

    fn dispatch_depth(&self) -> usize;

    fn statistics(&self) -> Statistics;

    fn attach_strategy(&self, strategy: Arc<dyn DispatchStrategy>);

    fn detach_strategy(&self, strategy: &Arc<dyn DispatchStrategy>);

    fn as_any(&self) -> &dyn Any;
}

impl<K, V, E> Dispatchable for DataLoader<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn dispatch_with(&self) -> usize {
        self.dispatch().key_count()
    }

    fn dispatch_job(&self) -> (usize, BoxFuture<'static, ()>) {
        let result = self.dispatch();
        (result.key_count(), result.map(drop).boxed())
    }

    fn dispatch_depth(&self) -> usize {
        DataLoader::dispatch_depth(self)
    }

    fn statistics(&self) -> Statistics {
        DataLoader::statistics(self)
    }

    fn attach_strategy(&self, strategy: Arc<dyn DispatchStrategy>) {
        DataLoader::attach_strategy(self, strategy)
    }

    fn detach_strategy(&self, strategy: &Arc<dyn DispatchStrategy>) {
        DataLoader::detach_strategy(self, strategy)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone)]
pub(crate) struct RegistryEntry {
    pub name: String,
    pub loader: Arc<dyn Dispatchable>,
}

pub(crate) struct RegistryInner {
    loaders: ArcSwap<Vec<RegistryEntry>>,
    strategy: Option<Arc<dyn DispatchStrategy>>,
    not_busy: Option<Arc<NotBusyDispatchStrategy>>,
}

impl RegistryInner {
    /// The current loaders. Registration never mutates a published list, so
    /// the snapshot is stable for as long as it's held.
    pub fn loaders(&self) -> Arc<Vec<RegistryEntry>> {
        self.loaders.load_full()
    }
}

/// A named collection of loaders.
///
/// Loaders of different key and value types can share a registry; typed
/// access is recovered with [`get`](DataLoaderRegistry::get). A registry can
/// dispatch all of its loaders at once, report their combined statistics,
/// and optionally dispatch them automatically through a
/// [`DispatchStrategy`].
///
/// Registration is copy-on-write, so dispatching and lookups never wait on a
/// registration in progress. `DataLoaderRegistry` is a cheap, shareable
/// handle; clones share all state.
#[derive(Clone)]
pub struct DataLoaderRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for DataLoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLoaderRegistry {
    /// A registry without automatic dispatch. Call
    /// [`dispatch_all`](Self::dispatch_all) to dispatch.
    pub fn new() -> Self {
        Self::from_inner(RegistryInner {
            loaders: ArcSwap::from_pointee(Vec::new()),
            strategy: None,
            not_busy: None,
        })
    }

    /// A registry whose loaders are dispatched automatically by a
    /// [`NotBusyDispatchStrategy`].
    pub fn with_not_busy_dispatch() -> Self {
        Self {
            inner: Arc::new_cyclic(|registry| {
                let not_busy = Arc::new(NotBusyDispatchStrategy::new(registry.clone()));
                RegistryInner {
                    loaders: ArcSwap::from_pointee(Vec::new()),
                    strategy: Some(not_busy.clone()),
                    not_busy: Some(not_busy),
                }
            }),
        }
    }

    /// A registry that notifies `strategy` of every load on its loaders.
    pub fn with_dispatch_strategy(strategy: Arc<dyn DispatchStrategy>) -> Self {
        Self::from_inner(RegistryInner {
            loaders: ArcSwap::from_pointee(Vec::new()),
            strategy: Some(strategy),
            not_busy: None,
        })
    }

    fn from_inner(inner: RegistryInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The not-busy strategy, if this registry was built with one.
    pub fn not_busy_strategy(&self) -> Option<&Arc<NotBusyDispatchStrategy>> {
        self.inner.not_busy.as_ref()
    }

    /// Register `loader` under `name`, replacing any loader already
    /// registered under that name. Returns `self` for chaining.
    ///
    /// A loader reports its loads to at most one dispatch strategy. If this
    /// registry has one, registering takes the loader over from any other
    /// registry's strategy; that registry still lists the loader and
    /// dispatches it from `dispatch_all`.
    pub fn register<K, V, E>(&self, name: impl Into<String>, loader: &DataLoader<K, V, E>) -> &Self
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let name = name.into();
        let loader: Arc<dyn Dispatchable> = Arc::new(loader.clone());

        let previous = self.inner.loaders.rcu(|current| {
            let mut next: Vec<RegistryEntry> = current
                .iter()
                .filter(|entry| entry.name != name)
                .cloned()
                .collect();
            next.push(RegistryEntry {
                name: name.clone(),
                loader: loader.clone(),
            });
            next
        });

        if let Some(strategy) = &self.inner.strategy {
            // The replaced loader may be this same loader, so detach before
            // attaching.
            if let Some(replaced) = previous.iter().find(|entry| entry.name == name) {
                replaced.loader.detach_strategy(strategy);
            }
            loader.attach_strategy(strategy.clone());
        }

        debug!(name = %name, "registered loader");

        self
    }

    /// Remove the loader registered under `name`. Returns true if there was
    /// one. The removed loader no longer notifies this registry's strategy.
    pub fn unregister(&self, name: &str) -> bool {
        let previous = self.inner.loaders.rcu(|current| {
            current
                .iter()
                .filter(|entry| entry.name != name)
                .cloned()
                .collect::<Vec<_>>()
        });

        match previous.iter().find(|entry| entry.name == name) {
            Some(removed) => {
                if let Some(strategy) = &self.inner.strategy {
                    removed.loader.detach_strategy(strategy);
                }
                debug!(name, "unregistered loader");
                true
            }
            None => false,
        }
    }

    /// The loader registered under `name`, if there is one with these types.
    pub fn get<K, V, E>(&self, name: &str) -> Option<DataLoader<K, V, E>>
    where
        K: 'static,
        V: 'static,
        E: 'static,
    {
        self.inner
            .loaders
            .load()
            .iter()
            .find(|entry| entry.name == name)?
            .loader
            .as_any()
            .downcast_ref::<DataLoader<K, V, E>>()
            .cloned()
    }

    /// Registered names, in registration order.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .loaders
            .load()
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.loaders.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch every registered loader. Awaiting the result drives every
    /// dispatched batch to completion; handles drive them as well, so the
    /// result can also be dropped.
    pub fn dispatch_all(&self) -> RegistryDispatch {
        let loaders = self.inner.loaders();
        let mut key_count = 0;
        let mut jobs = Vec::with_capacity(loaders.len());

        for entry in loaders.iter() {
            let (count, job) = entry.loader.dispatch_job();
            key_count += count;
            jobs.push(job);
        }

        RegistryDispatch {
            key_count,
            jobs: future::join_all(jobs).map(drop).boxed(),
        }
    }

    /// The total number of loads waiting for dispatch, across all loaders.
    pub fn dispatch_depth(&self) -> usize {
        self.inner
            .loaders
            .load()
            .iter()
            .map(|entry| entry.loader.dispatch_depth())
            .sum()
    }

    /// Statistics summed across all loaders.
    pub fn statistics(&self) -> Statistics {
        self.inner
            .loaders
            .load()
            .iter()
            .map(|entry| entry.loader.statistics())
            .sum()
    }
}

impl Debug for DataLoaderRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoaderRegistry")
            .field("loaders", &self.keys())
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}

/// The outcome of [`DataLoaderRegistry::dispatch_all`].
#[must_use = "a dispatch's batch calls run when its result or one of its handles is polled"]
pub struct RegistryDispatch {
    key_count: usize,
    jobs: BoxFuture<'static, ()>,
}

impl RegistryDispatch {
    /// The number of keys dispatched across all loaders.
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    /// Block until every dispatched batch has completed.
    pub fn join(self) {
        futures::executor::block_on(self)
    }
}

impl Debug for RegistryDispatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryDispatch")
            .field("key_count", &self.key_count)
            .finish()
    }
}

impl Future for RegistryDispatch {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        self.jobs.poll_unpin(ctx)
    }
}
