//! Load statistics.
//!
//! A loader reports every event to its [`StatisticsCollector`]; the collector
//! can be asked for a [`Statistics`] snapshot at any time. Snapshots from
//! several loaders can be combined into registry-wide totals.

use std::{
    fmt::Debug,
    ops::Add,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A point-in-time copy of a loader's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Calls to `load`.
    pub load_count: u64,

    /// Keys whose individual outcome was an error.
    pub load_error_count: u64,

    /// Calls made to the batch function.
    pub batch_invoke_count: u64,

    /// Keys handed to dispatched batches.
    pub batch_load_count: u64,

    /// Batch function calls that failed as a whole.
    pub batch_load_exception_count: u64,

    /// Loads satisfied by the promise tier.
    pub cache_hit_count: u64,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    match denominator {
        0 => 0.0,
        denominator => numerator as f64 / denominator as f64,
    }
}

impl Statistics {
    pub fn cache_miss_count(&self) -> u64 {
        self.load_count.saturating_sub(self.cache_hit_count)
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        ratio(self.cache_hit_count, self.load_count)
    }

    pub fn load_error_ratio(&self) -> f64 {
        ratio(self.load_error_count, self.load_count)
    }

    pub fn batch_load_ratio(&self) -> f64 {
        ratio(self.batch_load_count, self.load_count)
    }

    pub fn batch_load_exception_ratio(&self) -> f64 {
        ratio(self.batch_load_exception_count, self.load_count)
    }

    /// Field-wise sum of two snapshots.
    pub fn combine(&self, other: &Statistics) -> Statistics {
        Statistics {
            load_count: self.load_count + other.load_count,
            load_error_count: self.load_error_count + other.load_error_count,
            batch_invoke_count: self.batch_invoke_count + other.batch_invoke_count,
            batch_load_count: self.batch_load_count + other.batch_load_count,
            batch_load_exception_count: self.batch_load_exception_count
                + other.batch_load_exception_count,
            cache_hit_count: self.cache_hit_count + other.cache_hit_count,
        }
    }
}

impl Add for Statistics {
    type Output = Statistics;

    fn add(self, other: Statistics) -> Statistics {
        self.combine(&other)
    }
}

impl std::iter::Sum for Statistics {
    fn sum<I: Iterator<Item = Statistics>>(iter: I) -> Statistics {
        iter.fold(Statistics::default(), Add::add)
    }
}

/// Receives loader events. Implementations must be safe to call from any
/// thread, concurrently.
pub trait StatisticsCollector: Send + Sync + Debug {
    fn increment_load_count(&self);

    fn increment_load_error_count(&self);

    /// Called once per batch function call.
    fn increment_batch_invoke_count(&self);

    /// Called once per dispatched batch, with the number of keys in it.
    fn increment_batch_load_count_by(&self, delta: u64);

    fn increment_batch_load_exception_count(&self);

    fn increment_cache_hit_count(&self);

    fn statistics(&self) -> Statistics;
}

/// Lock-free counters. This is the default collector.
#[derive(Debug, Default)]
pub struct SimpleStatisticsCollector {
    load_count: AtomicU64,
    load_error_count: AtomicU64,
    batch_invoke_count: AtomicU64,
    batch_load_count: AtomicU64,
    batch_load_exception_count: AtomicU64,
    cache_hit_count: AtomicU64,
}

impl SimpleStatisticsCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatisticsCollector for SimpleStatisticsCollector {
    fn increment_load_count(&self) {
        self.load_count.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_load_error_count(&self) {
        self.load_error_count.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_batch_invoke_count(&self) {
        self.batch_invoke_count.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_batch_load_count_by(&self, delta: u64) {
        self.batch_load_count.fetch_add(delta, Ordering::Relaxed);
    }

    fn increment_batch_load_exception_count(&self) {
        self.batch_load_exception_count
            .fetch_add(1, Ordering::Relaxed);
    }

    fn increment_cache_hit_count(&self) {
        self.cache_hit_count.fetch_add(1, Ordering::Relaxed);
    }

    fn statistics(&self) -> Statistics {
        Statistics {
            load_count: self.load_count.load(Ordering::Relaxed),
            load_error_count: self.load_error_count.load(Ordering::Relaxed),
            batch_invoke_count: self.batch_invoke_count.load(Ordering::Relaxed),
            batch_load_count: self.batch_load_count.load(Ordering::Relaxed),
            batch_load_exception_count: self.batch_load_exception_count.load(Ordering::Relaxed),
            cache_hit_count: self.cache_hit_count.load(Ordering::Relaxed),
        }
    }
}

/// Discards every event and always reports zeroes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStatisticsCollector;

impl StatisticsCollector for NoOpStatisticsCollector {
    fn increment_load_count(&self) {}
    fn increment_load_error_count(&self) {}
    fn increment_batch_invoke_count(&self) {}
    fn increment_batch_load_count_by(&self, _delta: u64) {}
    fn increment_batch_load_exception_count(&self) {}
    fn increment_cache_hit_count(&self) {}

    fn statistics(&self) -> Statistics {
        Statistics::default()
    }
}

/// Feeds every event to two collectors, and reports the first one's
/// snapshot. Useful for keeping a per-loader count alongside a shared one.
#[derive(Debug, Clone)]
pub struct DelegatingStatisticsCollector {
    primary: Arc<dyn StatisticsCollector>,
    delegate: Arc<dyn StatisticsCollector>,
}

impl DelegatingStatisticsCollector {
    pub fn new(
        primary: Arc<dyn StatisticsCollector>,
        delegate: Arc<dyn StatisticsCollector>,
    ) -> Self {
        Self { primary, delegate }
    }

    pub fn delegate_statistics(&self) -> Statistics {
        self.delegate.statistics()
    }
}

impl StatisticsCollector for DelegatingStatisticsCollector {
    fn increment_load_count(&self) {
        self.primary.increment_load_count();
        self.delegate.increment_load_count();
    }

    fn increment_load_error_count(&self) {
        self.primary.increment_load_error_count();
        self.delegate.increment_load_error_count();
    }

    fn increment_batch_invoke_count(&self) {
        self.primary.increment_batch_invoke_count();
        self.delegate.increment_batch_invoke_count();
    }

    fn increment_batch_load_count_by(&self, delta: u64) {
        self.primary.increment_batch_load_count_by(delta);
        self.delegate.increment_batch_load_count_by(delta);
    }

    fn increment_batch_load_exception_count(&self) {
        self.primary.increment_batch_load_exception_count();
        self.delegate.increment_batch_load_exception_count();
    }

    fn increment_cache_hit_count(&self) {
        self.primary.increment_cache_hit_count();
        self.delegate.increment_cache_hit_count();
    }

    fn statistics(&self) -> Statistics {
        self.primary.statistics()
    }
}
