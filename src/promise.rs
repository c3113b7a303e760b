//! The per-key result handle returned by `DataLoader::load`.

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;

use crate::{
    error::LoadError,
    wakerset::{Token as WakerToken, WakerSet},
};

/// The shared job that runs one dispatch's batch calls. Every handle in the
/// dispatch holds a clone, and whichever handle is polled drives it.
pub(crate) type Driver = Shared<BoxFuture<'static, ()>>;

pub type LoadResult<V, E> = Result<V, LoadError<E>>;

enum State<V, E> {
    /// Waiting for a dispatch. `driver` is attached once the key's batch has
    /// been dispatched.
    Pending {
        wakers: WakerSet,
        driver: Option<Driver>,
    },

    Done(LoadResult<V, E>),
}

struct Inner<V, E> {
    state: Mutex<State<V, E>>,
}

/// A handle to the eventual result of loading a single key.
///
/// Handles are cheap to clone, and every clone observes the same result; a
/// cache hit returns a clone of the handle created by the original `load`.
/// Awaiting a handle also drives the batch call its key was dispatched in, so
/// no background executor is needed: any one interested task will run the
/// batch function, and the others are woken when it finishes.
///
/// Dropping a handle never cancels the batch. Other handles, or the
/// `DispatchResult`, can still drive it to completion.
pub struct LoadFuture<V, E> {
    inner: Arc<Inner<V, E>>,
    waker_token: Option<WakerToken>,

    // Kept across polls so that the shared driver remembers our waker.
    driver: Option<Driver>,
}

impl<V, E> LoadFuture<V, E> {
    fn from_state(state: State<V, E>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
            }),
            waker_token: None,
            driver: None,
        }
    }

    pub(crate) fn pending() -> Self {
        Self::from_state(State::Pending {
            wakers: WakerSet::default(),
            driver: None,
        })
    }

    /// A handle that is already complete.
    pub fn ready(result: LoadResult<V, E>) -> Self {
        Self::from_state(State::Done(result))
    }

    /// True once the key has a value or an error.
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(..))
    }

    /// True if both handles refer to the same underlying load.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Complete this load. Returns false (and discards `result`) if it was
    /// already complete.
    pub(crate) fn complete(&self, result: LoadResult<V, E>) -> bool {
        let mut guard = self.inner.state.lock();
        match *guard {
            State::Done(..) => false,
            State::Pending { .. } => {
                let previous = mem::replace(&mut *guard, State::Done(result));
                drop(guard);

                if let State::Pending { wakers, .. } = previous {
                    wakers.wake_all();
                }
                true
            }
        }
    }

    /// Attach the job that will complete this load. The current driving
    /// waker (if any task is already awaiting this handle) is woken so that
    /// it starts driving the batch.
    pub(crate) fn attach_driver(&self, job: &Driver) {
        let mut guard = self.inner.state.lock();
        if let State::Pending {
            ref mut wakers,
            ref mut driver,
        } = *guard
        {
            *driver = Some(job.clone());
            wakers.wake_driver();
        }
    }
}

impl<V: Clone, E: Clone> LoadFuture<V, E> {
    /// The result, if the load has completed.
    pub fn peek(&self) -> Option<LoadResult<V, E>> {
        match *self.inner.state.lock() {
            State::Done(ref result) => Some(result.clone()),
            State::Pending { .. } => None,
        }
    }
}

impl<V, E> Clone for LoadFuture<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            waker_token: None,
            driver: None,
        }
    }
}

impl<V: Debug, E: Debug> Debug for LoadFuture<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.inner.state.lock();
        let mut out = f.debug_struct("LoadFuture");
        match *guard {
            State::Pending { ref driver, .. } => out
                .field("state", &"pending")
                .field("dispatched", &driver.is_some()),
            State::Done(ref result) => out.field("result", result),
        };
        out.finish()
    }
}

impl<V: Clone, E: Clone> Future for LoadFuture<V, E> {
    type Output = LoadResult<V, E>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        loop {
            // Note that this lock is never held while the driver is polled:
            // the driver completes loads (including this one), which needs
            // the same lock.
            {
                let mut guard = unpinned.inner.state.lock();
                match *guard {
                    State::Done(ref result) => {
                        let result = result.clone();
                        drop(guard);
                        unpinned.waker_token = None;
                        unpinned.driver = None;
                        return Poll::Ready(result);
                    }
                    State::Pending {
                        ref mut wakers,
                        ref driver,
                    } => {
                        wakers.upsert(&mut unpinned.waker_token, ctx.waker());
                        if unpinned.driver.is_none() {
                            unpinned.driver = driver.clone();
                        }
                    }
                }
            }

            match unpinned.driver.as_mut() {
                // Not dispatched yet. attach_driver will wake us.
                None => return Poll::Pending,
                Some(driver) => match driver.poll_unpin(ctx) {
                    Poll::Pending => return Poll::Pending,

                    // The driver completes every load it owns before it
                    // finishes, so the next pass through the loop will see
                    // Done. If it somehow doesn't, forget the finished driver
                    // and wait for the next one rather than spinning.
                    Poll::Ready(()) => {
                        unpinned.driver = None;
                        let mut guard = unpinned.inner.state.lock();
                        if let State::Pending { ref mut driver, .. } = *guard {
                            if driver.as_ref().map_or(false, |d| d.peek().is_some()) {
                                *driver = None;
                                return Poll::Pending;
                            }
                        }
                    }
                },
            }
        }
    }
}

impl<V, E> Drop for LoadFuture<V, E> {
    fn drop(&mut self) {
        // If this handle was the one driving the batch, another waiting
        // handle has to take over. WakerSet selects and wakes one.
        if let Some(token) = self.waker_token.take() {
            if let State::Pending { ref mut wakers, .. } = *self.inner.state.lock() {
                wakers.discard_and_wake(token);
            }
        }
    }
}
