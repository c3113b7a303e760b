//! Aggregation of several independent fallible futures into one completion.
//!
//! [`combine`] waits for every constituent future, regardless of whether
//! each one succeeds or fails, and yields a [`PromisedValues`] that records
//! every individual outcome. A failing constituent never short-circuits the
//! aggregate and never hides its siblings' results, which is what lets a
//! loader hand back best-effort per-key results for a partially failed batch.

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use futures::FutureExt;

enum Slot<F: Future> {
    Pending(Pin<Box<F>>),
    Done(F::Output),
    Taken,
}

/// A future that completes once every constituent future has completed. See
/// [`combine`].
#[must_use = "futures do nothing unless polled"]
pub struct Combine<F: Future> {
    slots: Vec<Slot<F>>,
    remaining: usize,
}

/// Combine several fallible futures into one.
///
/// The returned future resolves to a [`PromisedValues`] holding each
/// future's outcome at the same index it was given.
pub fn combine<I, F, T, E>(futures: I) -> Combine<F>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    let slots: Vec<Slot<F>> = futures
        .into_iter()
        .map(|fut| Slot::Pending(Box::pin(fut)))
        .collect();

    Combine {
        remaining: slots.len(),
        slots,
    }
}

impl<F, T, E> Combine<F>
where
    F: Future<Output = Result<T, E>>,
{
    /// Flatten several combined futures into one, preserving order: the
    /// results of the first come first, and so on.
    pub fn chain(combined: impl IntoIterator<Item = Combine<F>>) -> Self {
        let mut slots = Vec::new();
        let mut remaining = 0;

        for part in combined {
            remaining += part.remaining;
            slots.extend(part.slots);
        }

        Combine { slots, remaining }
    }

    /// The number of constituent futures.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// True once every constituent has completed.
    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Run `handler` once every constituent has completed, then yield the
    /// same [`PromisedValues`]; per-index state stays queryable inside the
    /// handler and afterwards.
    pub fn on_complete<H>(self, handler: H) -> impl Future<Output = PromisedValues<T, E>>
    where
        H: FnOnce(&PromisedValues<T, E>),
    {
        self.map(move |values| {
            handler(&values);
            values
        })
    }

    /// Block the current thread until every constituent has completed.
    pub fn join(self) -> PromisedValues<T, E> {
        futures::executor::block_on(self)
    }
}

impl<F: Future> Debug for Combine<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Combine")
            .field("len", &self.slots.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl<F, T, E> Future for Combine<F>
where
    F: Future<Output = Result<T, E>>,
{
    type Output = PromisedValues<T, E>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        // Every field is Unpin; the constituents are boxed.
        let this = Pin::into_inner(self);

        for slot in this.slots.iter_mut() {
            if let Slot::Pending(fut) = slot {
                if let Poll::Ready(output) = fut.as_mut().poll(ctx) {
                    *slot = Slot::Done(output);
                    this.remaining -= 1;
                }
            }
        }

        if this.remaining > 0 {
            return Poll::Pending;
        }

        let results = this
            .slots
            .iter_mut()
            .filter_map(|slot| match mem::replace(slot, Slot::Taken) {
                Slot::Done(output) => Some(output),
                Slot::Pending(..) | Slot::Taken => None,
            })
            .collect();

        Poll::Ready(PromisedValues { results })
    }
}

impl<F: Future> Unpin for Combine<F> {}

/// The completed outcome of a [`Combine`]: a fixed-size, ordered record of
/// which constituents succeeded and which failed.
///
/// None of the accessors panic. Out-of-range indexes read as "no value, no
/// cause".
#[derive(Clone, PartialEq, Eq)]
pub struct PromisedValues<T, E> {
    results: Vec<Result<T, E>>,
}

impl<T, E> PromisedValues<T, E> {
    /// Concatenate several completed aggregates.
    pub fn concat(parts: impl IntoIterator<Item = PromisedValues<T, E>>) -> Self {
        PromisedValues {
            results: parts.into_iter().flat_map(|part| part.results).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// True if every constituent succeeded. Vacuously true when empty.
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    pub fn any_failed(&self) -> bool {
        !self.all_succeeded()
    }

    /// The cause of the first failed constituent.
    pub fn first_cause(&self) -> Option<&E> {
        self.results.iter().find_map(|result| result.as_ref().err())
    }

    /// Whether the constituent at `index` succeeded.
    pub fn succeeded(&self, index: usize) -> bool {
        matches!(self.results.get(index), Some(Ok(..)))
    }

    /// The failure of the constituent at `index`, if it failed.
    pub fn cause(&self, index: usize) -> Option<&E> {
        self.results.get(index)?.as_ref().err()
    }

    /// The value of the constituent at `index`, if it succeeded.
    pub fn value_at(&self, index: usize) -> Option<&T> {
        self.results.get(index)?.as_ref().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Result<T, E>> + '_ {
        self.results.iter()
    }

    /// All successful values in order, with each failed slot as `None`.
    pub fn into_values(self) -> Vec<Option<T>> {
        self.results.into_iter().map(Result::ok).collect()
    }

    pub fn into_results(self) -> Vec<Result<T, E>> {
        self.results
    }
}

impl<T: Clone, E> PromisedValues<T, E> {
    /// All successful values in order, with each failed slot as `None`.
    pub fn to_values(&self) -> Vec<Option<T>> {
        self.results
            .iter()
            .map(|result| result.as_ref().ok().cloned())
            .collect()
    }
}

impl<T, E> Default for PromisedValues<T, E> {
    fn default() -> Self {
        PromisedValues {
            results: Vec::new(),
        }
    }
}

impl<T: Debug, E: Debug> Debug for PromisedValues<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.results.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{combine, Combine};
    use futures::{channel::oneshot, executor, future, task::noop_waker_ref, FutureExt};
    use std::{cell::Cell, task::Context};

    #[test]
    fn failures_do_not_hide_siblings() {
        let values = combine(vec![
            future::ready(Ok::<_, String>(1)),
            future::ready(Err("boom".to_owned())),
            future::ready(Ok(3)),
        ])
        .join();

        assert_eq!(values.len(), 3);
        assert!(values.succeeded(0));
        assert!(!values.succeeded(1));
        assert_eq!(values.cause(1).map(String::as_str), Some("boom"));
        assert_eq!(values.value_at(2), Some(&3));
        assert_eq!(values.to_values(), vec![Some(1), None, Some(3)]);
        assert!(values.any_failed());
        assert_eq!(values.first_cause().map(String::as_str), Some("boom"));
    }

    #[test]
    fn out_of_range_accessors_do_not_panic() {
        let values = combine(Vec::<future::Ready<Result<u8, ()>>>::new()).join();

        assert!(values.is_empty());
        assert!(values.all_succeeded());
        assert!(!values.succeeded(5));
        assert_eq!(values.cause(5), None);
        assert_eq!(values.value_at(5), None);
    }

    #[test]
    fn completes_only_after_every_constituent() {
        let (send1, recv1) = oneshot::channel::<Result<u8, ()>>();
        let (send2, recv2) = oneshot::channel::<Result<u8, ()>>();

        let flatten = |recv: oneshot::Receiver<Result<u8, ()>>| {
            recv.map(|result| result.unwrap_or(Err(())))
        };

        let mut ctx = Context::from_waker(noop_waker_ref());
        let mut combined = combine(vec![flatten(recv1), flatten(recv2)]);
        assert!(combined.poll_unpin(&mut ctx).is_pending());

        send2.send(Ok(2)).unwrap();
        assert!(combined.poll_unpin(&mut ctx).is_pending());
        assert!(!combined.is_done());

        send1.send(Err(())).unwrap();
        let values = executor::block_on(combined);
        assert_eq!(values.to_values(), vec![None, Some(2)]);
    }

    #[test]
    fn on_complete_runs_once_with_the_aggregate() {
        let calls = Cell::new(0);

        let combined = combine(vec![
            future::ready(Ok::<_, ()>("a")),
            future::ready(Err(())),
        ]);

        let values = executor::block_on(combined.on_complete(|values| {
            calls.set(calls.get() + 1);
            assert!(values.succeeded(0));
            assert!(!values.succeeded(1));
        }));

        assert_eq!(calls.get(), 1);
        assert_eq!(values.into_values(), vec![Some("a"), None]);
    }

    #[test]
    fn chain_preserves_order() {
        let first = combine(vec![future::ready(Ok::<_, ()>(1)), future::ready(Ok(2))]);
        let second = combine(vec![future::ready(Ok::<_, ()>(3))]);

        let values = Combine::chain(vec![first, second]).join();
        assert_eq!(values.into_values(), vec![Some(1), Some(2), Some(3)]);
    }
}
