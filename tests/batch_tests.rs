//! These tests are intended to ensure that a batch function is called the
//! correct number of times, with the correct keys, for different
//! configurations

use batchdispatch::{
    BatchEnvironment, BatchLoader, Context, DataLoader, LoadError, LoaderOptions,
};
use crossbeam;
use futures::{executor, executor::ThreadPool, future, task::SpawnExt};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
    time::Duration,
};

async fn stringify(keys: Vec<usize>) -> Result<Vec<String>, ()> {
    Ok(keys.into_iter().map(|key| key.to_string()).collect())
}

async fn echo<K>(keys: Vec<K>) -> Result<Vec<K>, ()> {
    Ok(keys)
}

fn call_counter<T, R>(
    counter: &Arc<AtomicUsize>,
    function: impl Fn(T) -> R + Send + Sync + 'static,
) -> impl Fn(T) -> R + Send + Sync + 'static {
    let counter = counter.clone();
    move |argument| {
        counter.fetch_add(1, Ordering::SeqCst);
        function(argument)
    }
}

/// Wrap a batch function so that every key list it's called with is logged
fn recorder<K, Fut>(
    log: &Arc<Mutex<Vec<Vec<K>>>>,
    function: impl Fn(Vec<K>) -> Fut + Send + Sync + 'static,
) -> impl Fn(Vec<K>) -> Fut + Send + Sync + 'static
where
    K: Clone + Send + 'static,
{
    let log = log.clone();
    move |keys: Vec<K>| {
        log.lock().push(keys.clone());
        function(keys)
    }
}

#[test]
fn simple_test() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = DataLoader::from_fn(recorder(&calls, echo::<String>));

    let fut1 = loader.load("A".to_owned());
    let fut2 = loader.load("B".to_owned());

    let values = executor::block_on(loader.dispatch());
    assert_eq!(values.len(), 2);
    assert!(values.all_succeeded());

    let res1 = executor::block_on(fut1);
    let res2 = executor::block_on(fut2);

    assert_eq!(res1.unwrap(), "A");
    assert_eq!(res2.unwrap(), "B");
    assert_eq!(*calls.lock(), vec![vec!["A".to_owned(), "B".to_owned()]]);
}

#[test]
fn nothing_runs_before_dispatch() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = DataLoader::from_fn(call_counter(&counter, stringify));

    let fut = loader.load(1);
    assert_eq!(loader.dispatch_depth(), 1);
    assert!(!fut.is_done());
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    let dispatched = loader.dispatch();
    assert_eq!(dispatched.key_count(), 1);
    assert_eq!(loader.dispatch_depth(), 0);

    // Dispatch only hands the keys over; the call runs when polled.
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(executor::block_on(fut).unwrap(), "1");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn empty_dispatch() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = DataLoader::from_fn(call_counter(&counter, stringify));

    let dispatched = loader.dispatch();
    assert_eq!(dispatched.key_count(), 0);
    assert!(dispatched.join().is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn max_batch_size_splits() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = DataLoader::with_options(
        BatchLoader::list(recorder(&calls, echo::<u32>)),
        LoaderOptions::new().with_max_batch_size(5),
    );

    let handles: Vec<_> = (0..21).map(|key| loader.load(key)).collect();
    let values = loader.dispatch().join();

    assert_eq!(values.into_values(), (0..21).map(Some).collect::<Vec<_>>());

    let sizes: Vec<usize> = calls.lock().iter().map(Vec::len).collect();
    assert_eq!(sizes, [5, 5, 5, 5, 1]);

    for (key, handle) in (0..21).zip(handles) {
        assert_eq!(executor::block_on(handle).unwrap(), key);
    }

    let stats = loader.statistics();
    assert_eq!(stats.batch_invoke_count, 5);
    assert_eq!(stats.batch_load_count, 21);
}

#[test]
fn failed_sub_batch_leaves_siblings_alone() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = DataLoader::with_options(
        BatchLoader::list(call_counter(&counter, |keys: Vec<u32>| async move {
            match keys.contains(&2) {
                true => Err("unavailable"),
                false => Ok(keys),
            }
        })),
        LoaderOptions::new().with_max_batch_size(2),
    );

    let values = loader.load_many(0..6);
    assert_eq!(loader.dispatch().key_count(), 6);
    let values = executor::block_on(values);
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    // Only the sub-batch [2, 3] failed
    assert_eq!(
        values.into_results(),
        vec![
            Ok(0),
            Ok(1),
            Err(LoadError::Load("unavailable")),
            Err(LoadError::Load("unavailable")),
            Ok(4),
            Ok(5),
        ]
    );

    // and only its keys were evicted
    for key in [0, 1, 4, 5] {
        assert!(loader.get_if_completed(&key).is_some());
    }
    assert!(loader.get_if_present(&2).is_none());
    assert!(loader.get_if_present(&3).is_none());

    let stats = loader.statistics();
    assert_eq!(stats.batch_invoke_count, 3);
    assert_eq!(stats.batch_load_exception_count, 1);
}

#[test]
fn zero_max_batch_size_means_unlimited() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = DataLoader::with_options(
        BatchLoader::list(call_counter(&counter, stringify)),
        LoaderOptions::new().with_max_batch_size(0),
    );

    let values = loader.load_many(0..10);
    loader.dispatch().join();

    assert!(executor::block_on(values).all_succeeded());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_duplicate_keys() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = DataLoader::from_fn(recorder(&calls, stringify));

    let fut1 = loader.load(10);
    let fut2 = loader.load(20);
    let fut3 = loader.load(10);
    let fut4 = loader.load(30);
    let fut5 = loader.load(20);

    assert!(fut1.ptr_eq(&fut3));
    assert!(fut2.ptr_eq(&fut5));

    let values = loader.dispatch().join();
    assert_eq!(values.len(), 3);

    assert_eq!(executor::block_on(fut1).unwrap(), "10");
    assert_eq!(executor::block_on(fut2).unwrap(), "20");
    assert_eq!(executor::block_on(fut3).unwrap(), "10");
    assert_eq!(executor::block_on(fut4).unwrap(), "30");
    assert_eq!(executor::block_on(fut5).unwrap(), "20");

    assert_eq!(*calls.lock(), vec![vec![10, 20, 30]]);
}

#[test]
fn duplicate_keys_without_caching() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = DataLoader::with_options(
        BatchLoader::list(recorder(&calls, stringify)),
        LoaderOptions::new().with_caching(false),
    );

    let futs: Vec<_> = [1, 2, 1, 3, 2].iter().map(|&key| loader.load(key)).collect();
    assert!(!futs[0].ptr_eq(&futs[2]));

    let values = loader.dispatch().join();
    assert_eq!(
        values.into_values(),
        ["1", "2", "1", "3", "2"]
            .iter()
            .map(|value| Some(value.to_string()))
            .collect::<Vec<_>>()
    );
    assert_eq!(*calls.lock(), vec![vec![1, 2, 1, 3, 2]]);
    assert!(loader.get_if_present(&1).is_none());
}

#[test]
fn load_many_preserves_order() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = DataLoader::from_fn(call_counter(&counter, stringify));

    let many = loader.load_many(vec![3, 1, 2]);
    assert_eq!(many.len(), 3);
    drop(loader.dispatch());

    let values = executor::block_on(many);
    assert_eq!(
        values.into_values(),
        vec![Some("3".to_owned()), Some("1".to_owned()), Some("2".to_owned())]
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn batching_disabled_loads_immediately() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = DataLoader::with_options(
        BatchLoader::list(recorder(&calls, stringify)),
        LoaderOptions::new().with_batching(false),
    );

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);
    assert_eq!(loader.dispatch_depth(), 0);
    assert_eq!(loader.dispatch().key_count(), 0);

    assert_eq!(executor::block_on(fut1).unwrap(), "1");
    assert_eq!(executor::block_on(fut2).unwrap(), "2");

    // Still cached
    let fut3 = loader.load(1);
    assert_eq!(executor::block_on(fut3).unwrap(), "1");

    assert_eq!(*calls.lock(), vec![vec![1], vec![2]]);
    assert_eq!(loader.statistics().cache_hit_count, 1);
}

#[test]
fn environment_carries_contexts() {
    let seen = Arc::new(Mutex::new(None));
    let seen_in_batch = seen.clone();

    let loader = DataLoader::with_options(
        BatchLoader::with_environment(move |keys: Vec<u32>, env: BatchEnvironment<u32>| {
            let tenant = env.context_as::<String>().cloned();
            let scopes: Vec<Option<u32>> = env
                .key_contexts_list()
                .iter()
                .map(|context| context.as_ref()?.downcast_ref::<u32>().copied())
                .collect();
            let by_key: HashMap<u32, u32> = keys
                .iter()
                .filter_map(|key| Some((*key, *env.key_context_as::<u32>(key)?)))
                .collect();

            *seen_in_batch.lock() = Some((tenant, scopes, by_key));
            future::ready(Ok::<_, ()>(keys.into_iter().map(Ok).collect::<Vec<_>>()))
        }),
        LoaderOptions::new()
            .with_caching(false)
            .with_context_provider(|| Some(Arc::new("tenant-7".to_owned()) as Context)),
    );

    let ctx = |scope: u32| Some(Arc::new(scope) as Context);
    let _a = loader.load_with_context(1, ctx(10));
    let _b = loader.load_with_context(2, None);
    let _c = loader.load_with_context(1, ctx(30));

    loader.dispatch().join();

    let (tenant, scopes, by_key) = seen.lock().take().unwrap();
    assert_eq!(tenant.as_deref(), Some("tenant-7"));

    // The positional view keeps every context; the keyed view keeps the last
    assert_eq!(scopes, [Some(10), None, Some(30)]);
    assert_eq!(by_key.get(&1), Some(&30));
    assert_eq!(by_key.get(&2), None);
}

#[test]
fn mapped_loader_fills_missing_keys() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let log = calls.clone();

    let loader = DataLoader::with_options(
        BatchLoader::mapped(move |keys: Vec<u32>, _env| {
            log.lock().push(keys.clone());
            let found: HashMap<u32, String> = keys
                .into_iter()
                .filter(|key| key % 2 == 0)
                .map(|key| (key, format!("even {}", key)))
                .collect();
            future::ready(Ok::<_, ()>(found))
        }),
        LoaderOptions::new().with_caching(false),
    );

    let many = loader.load_many(vec![1, 2, 2, 4]);
    drop(loader.dispatch());

    let values = executor::block_on(many);
    assert_eq!(
        values.into_values(),
        vec![
            Some(None),
            Some(Some("even 2".to_owned())),
            Some(Some("even 2".to_owned())),
            Some(Some("even 4".to_owned())),
        ]
    );

    // Mapped batch functions see each key once
    assert_eq!(*calls.lock(), vec![vec![1, 2, 4]]);
}

/// Load keys from several threads, and confirm that a single batch call was
/// made fulfilling all of them
#[test]
fn test_threaded() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = DataLoader::from_fn(call_counter(&counter, stringify));
    let loader_ref = &loader;

    let barrier = Barrier::new(5);
    let barrier_ref = &barrier;

    let result: Vec<String> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..4)
            .map(move |i| {
                s.spawn(move |_s| {
                    thread::sleep(Duration::from_millis(i as u64 + 2));
                    let fut = loader_ref.load(i);

                    // Wait for every thread to load, then for the dispatch
                    barrier_ref.wait();
                    barrier_ref.wait();

                    executor::block_on(fut).unwrap()
                })
            })
            .collect();

        barrier_ref.wait();
        assert_eq!(loader_ref.dispatch().key_count(), 4);
        barrier_ref.wait();

        let result: Vec<String> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        result
    })
    .unwrap();

    assert_eq!(result, &["0", "1", "2", "3"]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// A batch function that takes a while: several threads drive the same
/// shared job, and every one of them sees its own key.
#[test]
fn test_threaded_slow_batch() {
    fn slow_stringify(keys: Vec<usize>) -> impl Future<Output = Result<Vec<String>, ()>> {
        async move {
            futures_timer::Delay::new(Duration::from_millis(10)).await;
            stringify(keys).await
        }
    }

    let counter = Arc::new(AtomicUsize::new(0));
    let loader = DataLoader::from_fn(call_counter(&counter, slow_stringify));

    let futs: Vec<_> = (0..4).map(|key| loader.load(key)).collect();
    drop(loader.dispatch());

    let result: Vec<String> = crossbeam::scope(|s| {
        let threads: Vec<_> = futs
            .into_iter()
            .map(|fut| s.spawn(move |_s| executor::block_on(fut).unwrap()))
            .collect();

        threads.into_iter().map(|t| t.join().unwrap()).collect()
    })
    .unwrap();

    assert_eq!(result, &["0", "1", "2", "3"]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// Await handles from tasks on a thread pool; whichever task the dispatch
/// wakes first drives the batch for all of them.
#[test]
fn test_thread_pool() {
    let pool = ThreadPool::new().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = DataLoader::from_fn(call_counter(&counter, stringify));

    let tasks: Vec<_> = (0..8)
        .map(|key| pool.spawn_with_handle(loader.load(key)).unwrap())
        .collect();

    drop(loader.dispatch());

    let result: Vec<String> = executor::block_on(future::join_all(tasks))
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(
        result,
        (0..8).map(|key| key.to_string()).collect::<Vec<_>>()
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
