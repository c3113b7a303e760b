//! Automatic dispatch for the loaders of a registry.
//!
//! A [`DispatchStrategy`] is told about every `load` on the loaders it
//! governs, and decides when to dispatch them. [`NotBusyDispatchStrategy`]
//! dispatches as soon as a load arrives, unless the caller has declared
//! itself busy, in which case it waits until the busy count returns to zero.

use std::{
    fmt::{self, Debug, Formatter},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

use tracing::{debug, trace, warn};

use crate::registry::RegistryInner;

/// Decides when the loaders of a registry are dispatched.
pub trait DispatchStrategy: Send + Sync + Debug {
    /// Called after every `load` on a governed loader that queued a key,
    /// outside the loader's lock.
    fn load_called(self: Arc<Self>);

    /// Called before a governed loader polls its dispatched batch calls.
    fn batch_poll_started(&self) {}

    /// Called after that poll returns. Loads made by batch functions during
    /// the poll have been queued by now.
    fn batch_poll_finished(self: Arc<Self>) {}
}

/// The strategy as seen by a loader.
pub(crate) struct StrategyHook(Arc<dyn DispatchStrategy>);

impl StrategyHook {
    pub fn new(strategy: Arc<dyn DispatchStrategy>) -> Self {
        Self(strategy)
    }

    pub fn load_called(&self) {
        self.0.clone().load_called()
    }

    pub fn is(&self, strategy: &Arc<dyn DispatchStrategy>) -> bool {
        Arc::ptr_eq(&self.0, strategy)
    }

    /// Bracket one poll of a batch job.
    pub fn batch_poll(&self) -> BatchPollGuard {
        self.0.batch_poll_started();
        BatchPollGuard(self.0.clone())
    }
}

pub(crate) struct BatchPollGuard(Arc<dyn DispatchStrategy>);

impl Drop for BatchPollGuard {
    fn drop(&mut self) {
        self.0.clone().batch_poll_finished()
    }
}

// Layout of the state word, from the low bit up: one bit set while a sweep
// runs, one bit set when a load has arrived that no sweep has covered yet,
// and 30 bits of busy count.
const DISPATCHING: u32 = 1 << 0;
const NEEDS_DISPATCH: u32 = 1 << 1;
const BUSY_SHIFT: u32 = 2;
const BUSY_MASK: u32 = (1 << 30) - 1;

const fn busy_count(state: u32) -> u32 {
    (state >> BUSY_SHIFT) & BUSY_MASK
}

const fn with_busy_count(state: u32, count: u32) -> u32 {
    (state & !(BUSY_MASK << BUSY_SHIFT)) | ((count & BUSY_MASK) << BUSY_SHIFT)
}

const fn is_set(state: u32, flag: u32) -> bool {
    state & flag != 0
}

/// A decoded snapshot of a [`NotBusyDispatchStrategy`]'s state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinatorState {
    pub busy_count: u32,
    pub needs_dispatch: bool,
    pub is_dispatching: bool,
}

impl CoordinatorState {
    fn decode(state: u32) -> Self {
        Self {
            busy_count: busy_count(state),
            needs_dispatch: is_set(state, NEEDS_DISPATCH),
            is_dispatching: is_set(state, DISPATCHING),
        }
    }
}

/// Dispatches every loader of its registry whenever a load arrives and the
/// strategy isn't busy.
///
/// All state lives in one atomic word, updated only by compare-and-swap
/// loops; no caller ever blocks. At most one sweep (a dispatch of every
/// registered loader) runs at a time. Loads that arrive during a sweep,
/// including loads issued by batch functions, are picked up by another sweep
/// once the current one's batches complete, so chained loads need no
/// explicit dispatch.
///
/// A sweep ends as soon as every loader has been dispatched; it never waits
/// on batch calls. While a governed loader polls its batch calls the
/// strategy counts as busy, so the loads a batch function makes during one
/// poll are dispatched together once that poll returns.
pub struct NotBusyDispatchStrategy {
    state: AtomicU32,
    registry: Weak<RegistryInner>,
}

impl NotBusyDispatchStrategy {
    pub(crate) fn new(registry: Weak<RegistryInner>) -> Self {
        Self {
            state: AtomicU32::new(0),
            registry,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::decode(self.state.load(Ordering::Acquire))
    }

    /// Apply `update` to the state word until it sticks. `update` returns
    /// `None` to leave the state alone. Returns the new state, if updated.
    fn update(&self, mut update: impl FnMut(u32) -> Option<u32>) -> Option<u32> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = update(current)?;
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(..) => return Some(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Suppress automatic dispatch until a matching
    /// [`decrement_busy`](Self::decrement_busy).
    pub fn increment_busy(&self) {
        let updated = self.update(|state| match busy_count(state) {
            BUSY_MASK => None,
            count => Some(with_busy_count(state, count + 1)),
        });

        if updated.is_none() {
            warn!("busy count is saturated; ignoring increment");
        }
    }

    /// Release one level of busyness. Dropping to zero with loads pending
    /// starts a sweep right away, on this thread.
    pub fn decrement_busy(&self) {
        let updated = self.update(|state| match busy_count(state) {
            0 => None,
            count => Some(with_busy_count(state, count - 1)),
        });

        match updated {
            None => warn!("busy count is already zero; ignoring decrement"),
            Some(state) if busy_count(state) == 0 && is_set(state, NEEDS_DISPATCH) => {
                self.maybe_sweep()
            }
            Some(..) => {}
        }
    }

    /// Mark the strategy busy for the lifetime of the returned guard.
    pub fn busy(self: &Arc<Self>) -> BusyGuard {
        self.increment_busy();
        BusyGuard {
            strategy: self.clone(),
        }
    }

    fn maybe_sweep(&self) {
        if self.try_begin_sweep() {
            self.run_sweeps();
        }
    }

    /// Claim the right to sweep: only if no sweep runs, there is something
    /// to dispatch, and nobody is busy. Clears `NEEDS_DISPATCH` on success.
    fn try_begin_sweep(&self) -> bool {
        self.update(|state| {
            match !is_set(state, DISPATCHING)
                && is_set(state, NEEDS_DISPATCH)
                && busy_count(state) == 0
            {
                true => Some((state | DISPATCHING) & !NEEDS_DISPATCH),
                false => None,
            }
        })
        .is_some()
    }

    /// Called by the sweep owner after each pass. Either keeps the sweep
    /// going (loads arrived meanwhile, and nobody is busy), or releases
    /// `DISPATCHING`. Only the owner ever clears that bit.
    fn continue_or_finish(&self) -> bool {
        let mut again = false;
        self.update(|state| {
            again = is_set(state, NEEDS_DISPATCH) && busy_count(state) == 0;
            Some(match again {
                true => state & !NEEDS_DISPATCH,
                false => state & !DISPATCHING,
            })
        });
        again
    }

    /// Dispatch every loader, then again while loads keep arriving.
    fn run_sweeps(&self) {
        loop {
            if let Some(registry) = self.registry.upgrade() {
                let loaders = registry.loaders();
                let key_count: usize = loaders
                    .iter()
                    .map(|entry| entry.loader.dispatch_with())
                    .sum();

                trace!(loaders = loaders.len(), keys = key_count, "dispatch sweep");
            }

            if !self.continue_or_finish() {
                return;
            }

            debug!("loads arrived during the sweep; sweeping again");
        }
    }
}

impl DispatchStrategy for NotBusyDispatchStrategy {
    fn load_called(self: Arc<Self>) {
        let updated = self.update(|state| match is_set(state, NEEDS_DISPATCH) {
            true => None,
            false => Some(state | NEEDS_DISPATCH),
        });

        if updated.is_some() {
            self.maybe_sweep();
        }
    }

    fn batch_poll_started(&self) {
        self.increment_busy();
    }

    fn batch_poll_finished(self: Arc<Self>) {
        self.decrement_busy();
    }
}

impl Debug for NotBusyDispatchStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotBusyDispatchStrategy")
            .field("state", &self.state())
            .finish()
    }
}

/// Holds a [`NotBusyDispatchStrategy`] busy until dropped.
#[must_use = "the strategy is only busy while the guard is alive"]
#[derive(Debug)]
pub struct BusyGuard {
    strategy: Arc<NotBusyDispatchStrategy>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.strategy.decrement_busy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached() -> Arc<NotBusyDispatchStrategy> {
        Arc::new(NotBusyDispatchStrategy::new(Weak::new()))
    }

    #[test]
    fn busy_count_packing() {
        let state = with_busy_count(DISPATCHING | NEEDS_DISPATCH, 5);
        assert_eq!(busy_count(state), 5);
        assert!(is_set(state, DISPATCHING));
        assert!(is_set(state, NEEDS_DISPATCH));

        let state = with_busy_count(state, BUSY_MASK);
        assert_eq!(busy_count(state), BUSY_MASK);
        assert!(is_set(state, DISPATCHING));

        let state = with_busy_count(state, 0);
        assert_eq!(state, DISPATCHING | NEEDS_DISPATCH);
    }

    #[test]
    fn busy_suppresses_sweep() {
        let strategy = detached();
        strategy.increment_busy();
        strategy.clone().load_called();

        assert_eq!(
            strategy.state(),
            CoordinatorState {
                busy_count: 1,
                needs_dispatch: true,
                is_dispatching: false,
            }
        );

        // With no registry left, the sweep finishes immediately.
        strategy.decrement_busy();
        assert_eq!(strategy.state(), CoordinatorState::default());
    }

    #[test]
    fn decrement_below_zero_is_ignored() {
        let strategy = detached();
        strategy.decrement_busy();
        assert_eq!(strategy.state().busy_count, 0);

        {
            let _outer = strategy.busy();
            let _inner = strategy.busy();
            assert_eq!(strategy.state().busy_count, 2);
        }
        assert_eq!(strategy.state().busy_count, 0);
    }

    #[test]
    fn only_one_sweep_claims() {
        let strategy = detached();
        strategy.state.store(NEEDS_DISPATCH, Ordering::Release);

        assert!(strategy.try_begin_sweep());
        assert!(!strategy.try_begin_sweep());

        strategy.state.fetch_or(NEEDS_DISPATCH, Ordering::AcqRel);
        assert!(strategy.continue_or_finish());
        assert!(strategy.state().is_dispatching);
        assert!(!strategy.continue_or_finish());
        assert_eq!(strategy.state(), CoordinatorState::default());
    }
}
