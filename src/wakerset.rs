use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing a collection of wakers that are all interested
/// in a single pending load. Every clone of a load handle that has been
/// polled owns one entry, identified by its token.
///
/// Only one task needs to drive a dispatched batch to completion; the rest
/// just wait for the result. The WakerSet tracks the "driving waker", which
/// is the waker that most recently polled. When a batch driver is attached to
/// a load, only the driving waker is woken, so that a single task picks it up.
/// If the driving task loses interest (its handle is dropped), another waker
/// is selected and woken, so the shared batch always has a path forward. When
/// the load completes, every waker is woken.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are an ever-increasing integer. A load's WakerSet lives only
    // until the load resolves, so these don't run out.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
            driving_waker: None,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set and make it the driving waker. Returns the
    /// token for the entry; on subsequent polls, use `replace_waker`.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);

        self.wakers.insert(token.duplicate(), waker);
        self.driving_waker = Some(token.duplicate());
        token
    }

    /// Update the waker for an existing token and make it the driving waker.
    /// A token that is no longer present (because its set was replaced) is
    /// re-inserted.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        match self.wakers.get_mut(token) {
            Some(existing) => {
                if !existing.will_wake(waker) {
                    existing.clone_from(waker)
                }
            }
            None => {
                self.wakers.insert(token.duplicate(), waker.clone());
            }
        }

        self.driving_waker = Some(token.duplicate());
    }

    /// Register the waker in `cx` under `token`, allocating a token if this
    /// is the first poll.
    pub(crate) fn upsert(&mut self, token: &mut Option<Token>, waker: &Waker) {
        match token.as_ref() {
            Some(token) => self.replace_waker(token, waker),
            None => *token = Some(self.add_waker(waker.clone())),
        }
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker (or there is no driving waker), another waker is made the
    /// driving waker and awoken, so that it can take over driving the batch.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker.as_ref() == Some(&token) || self.driving_waker.is_none() {
            self.driving_waker = None;
            self.wake_driver();
        }
    }

    /// Wake the current driving waker. If there isn't one, pick an arbitrary
    /// waker to be the new driver.
    pub(crate) fn wake_driver(&mut self) {
        if let Some(waker) = self.driving_waker.as_ref().and_then(|token| self.wakers.get(token)) {
            waker.wake_by_ref();
            return;
        }

        match self.wakers.iter().next() {
            None => self.driving_waker = None,
            Some((token, waker)) => {
                self.driving_waker = Some(token.duplicate());
                waker.wake_by_ref();
            }
        }
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.wakers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::WakerSet;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::task::{Wake, Waker};

    #[derive(Default)]
    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker::default());
        (counter.clone(), Waker::from(counter))
    }

    #[test]
    fn dropping_the_driver_wakes_another() {
        let mut set = WakerSet::default();
        let (first, first_waker) = counting();
        let (second, second_waker) = counting();

        let _first_token = set.add_waker(first_waker);
        let second_token = set.add_waker(second_waker);

        // second is the most recent, so it's the driver. Discarding it must
        // hand the driving role to first.
        set.discard_and_wake(second_token);

        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn wake_driver_only_wakes_most_recent() {
        let mut set = WakerSet::default();
        let (first, first_waker) = counting();
        let (second, second_waker) = counting();

        let first_token = set.add_waker(first_waker.clone());
        let _second_token = set.add_waker(second_waker);
        set.replace_waker(&first_token, &first_waker);

        set.wake_driver();
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);

        set.wake_all();
        assert_eq!(first.0.load(Ordering::SeqCst), 2);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }
}
