//! Batchdispatch is a Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) originally
//! created by Facebook. Many independent callers each ask for a single key;
//! the loader gathers those keys into one call to a batch function, then
//! hands each caller the result for its own key, without the caller knowing
//! anything about the batch. It also remembers results, so asking for the
//! same key twice costs one fetch.
//!
//! ## Overview
//!
//! Start with a batch function: an async function that takes a list of keys
//! and returns one value per key, in the same order. Wrap it in a
//! [`DataLoader`]:
//!
//! ```
//! use batchdispatch::DataLoader;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct ApiError;
//!
//! async fn get_users(ids: Vec<u64>) -> Result<Vec<User>, ApiError> {
//!     Ok(ids
//!         .into_iter()
//!         .map(|id| User { id, name: format!("user-{}", id) })
//!         .collect())
//! }
//!
//! let users = DataLoader::from_fn(get_users);
//! ```
//!
//! Callers use [`load`](DataLoader::load), which returns a [`LoadFuture`] for
//! their key. Nothing is fetched yet: keys queue up until
//! [`dispatch`](DataLoader::dispatch) is called, at which point every queued
//! key goes to the batch function in one call. Awaiting any of the handles
//! (or the [`DispatchResult`]) drives that call.
//!
//! ```
//! # use batchdispatch::DataLoader;
//! # #[derive(Debug, Clone, PartialEq)] struct User { id: u64, name: String }
//! # #[derive(Debug, Clone)] struct ApiError;
//! # async fn get_users(ids: Vec<u64>) -> Result<Vec<User>, ApiError> {
//! #     Ok(ids.into_iter().map(|id| User { id, name: format!("user-{}", id) }).collect())
//! # }
//! use futures::executor::block_on;
//!
//! let users = DataLoader::from_fn(get_users);
//!
//! let alice = users.load(1);
//! let bob = users.load(2);
//!
//! // Both keys go to get_users in a single call.
//! let dispatched = users.dispatch();
//! assert_eq!(dispatched.key_count(), 2);
//!
//! let alice = block_on(alice).unwrap();
//! assert_eq!(alice.name, "user-1");
//!
//! // Bob's result was fetched in the same call, and is cached.
//! assert!(users.get_if_completed(&2).is_some());
//! assert_eq!(block_on(bob).unwrap().name, "user-2");
//! ```
//!
//! A batch function can fail the whole call, or (with
//! [`BatchLoader::try_list`]) fail individual keys. Either way, the failure
//! surfaces through the affected keys' handles as a [`LoadError`], carrying
//! the batch function's own error. Other keys are unaffected.
//!
//! ## Configuration
//!
//! [`LoaderOptions`] controls batching, caching, maximum batch sizes, custom
//! cache keys, pluggable caches, statistics and contexts. Batch functions come
//! in several shapes, all adapted through [`BatchLoader`]: plain lists,
//! lists with per-key failures, maps that may omit keys, and functions that
//! receive a [`BatchEnvironment`] with per-load contexts.
//!
//! ## Caching
//!
//! Loaders have two cache tiers. The promise tier ([`CacheMap`]) holds the
//! [`LoadFuture`] of every key loaded so far, completed or not, and is what
//! makes repeated loads of a key share one handle. The optional value tier
//! ([`ValueCache`]) is an asynchronous store of completed values, typically
//! external and shared between processes, consulted at dispatch time for
//! keys that missed the promise tier. Value-tier failures are always treated
//! as misses.
//!
//! ## Registries and automatic dispatch
//!
//! A [`DataLoaderRegistry`] groups loaders so they can be dispatched
//! together, and reports their combined [`Statistics`]. A registry built
//! with [`DataLoaderRegistry::with_not_busy_dispatch`] dispatches its
//! loaders automatically: every load triggers a dispatch, unless the caller
//! has marked the registry busy, and loads that arrive while a dispatch is in
//! progress are picked up as soon as it completes.
//!
//! ## Design notes
//!
//! ### Poll-driven design.
//!
//! In keeping with Rust's polling async design, all of the asynchronous
//! work in batchdispatch is driven through polling [`LoadFuture`]. The batch
//! function is not scheduled in any runtime or run in the background; it is
//! driven directly in the foreground by whichever handle is polled.
//!
//! The polling is designed to be as lazy as possible. Because a batch only
//! needs to be driven by a single task, each key tracks and notifies only a
//! single task to drive the shared batch job forward. The other handles are
//! woken only when data is available, or when the driving handle is dropped.
//!
//! ### Locking.
//!
//! Each loader has one lock, guarding its queue and its promise tier. The
//! batch function is never called while that lock is held, so a slow batch
//! never stalls concurrent loads. The dispatch coordinator takes no locks at
//! all.

mod cache;
mod combine;
mod data;
mod dispatch;
mod error;
mod loader;
mod options;
mod promise;
mod registry;
mod stats;
mod wakerset;

pub use cache::{CacheMap, CachedValues, DefaultCacheMap, NoOpValueCache, ValueCache, ValueCacheOptions};
pub use combine::{combine, Combine, PromisedValues};
pub use data::{BatchEnvironment, BatchLoader, BatchResult, Context, ContextProvider};
pub use dispatch::{BusyGuard, CoordinatorState, DispatchStrategy, NotBusyDispatchStrategy};
pub use error::{LoadError, ValueCacheError};
pub use loader::{DataLoader, DispatchResult};
pub use options::{CacheKeyFn, LoaderOptions, LoaderSettings};
pub use promise::{LoadFuture, LoadResult};
pub use registry::{DataLoaderRegistry, RegistryDispatch};
pub use stats::{
    DelegatingStatisticsCollector, NoOpStatisticsCollector, SimpleStatisticsCollector,
    Statistics, StatisticsCollector,
};
