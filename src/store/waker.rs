//! Blocking wake-up primitive keyed by notification counters.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why [`Waker::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The predicate held.
    Satisfied,
    /// [`Waker::wake`] was called since the last wait.
    Woken,
    /// The deadline passed.
    TimedOut,
}

/// Condition-variable wrapper woken by the dispatcher.
///
/// `poll_interval` bounds every wait: a waiter that hears nothing for that
/// long returns [`Wake::TimedOut`] and is expected to re-read the store itself.
pub struct Waker {
    state: Mutex<WakerState>,
    cond: Condvar,
    poll_interval: Option<Duration>,
}

#[derive(Default)]
struct WakerState {
    woken: bool,
    seq: Option<u32>,
}

impl Waker {
    pub fn new(poll_interval: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(WakerState::default()),
            cond: Condvar::new(),
            poll_interval,
        }
    }

    /// Wake every current waiter.
    pub fn wake(&self) {
        let mut state = self.state.lock();
        state.woken = true;
        self.cond.notify_all();
    }

    /// Wake with the sequence number that triggered it.
    pub(super) fn wake_at(&self, seq: u32) {
        let mut state = self.state.lock();
        state.seq = Some(seq);
        state.woken = true;
        self.cond.notify_all();
    }

    /// Record a sequence number without waking anyone.
    pub(super) fn seed(&self, seq: Option<u32>) {
        let mut state = self.state.lock();
        if state.seq.is_none() {
            state.seq = seq;
        }
    }

    /// Last sequence number delivered by the dispatcher.
    pub fn seq(&self) -> Option<u32> {
        self.state.lock().seq
    }

    /// Block until `predicate` holds, [`wake`](Self::wake) is called, or the
    /// deadline passes.
    ///
    /// The predicate is re-checked after every wake-up, spurious or not, and
    /// runs with this waker's lock held: it must not take any lock that a
    /// caller of `wake` may hold.
    pub fn wait(&self, mut predicate: impl FnMut() -> bool, until: Option<Instant>) -> Wake {
        let deadline = match (until, self.poll_interval) {
            (Some(until), Some(poll)) => Some(until.min(Instant::now() + poll)),
            (Some(until), None) => Some(until),
            (None, Some(poll)) => Some(Instant::now() + poll),
            (None, None) => None,
        };

        let mut state = self.state.lock();
        loop {
            if predicate() {
                return Wake::Satisfied;
            }
            if state.woken {
                state.woken = false;
                return Wake::Woken;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Wake::TimedOut;
                    }
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

impl Default for Waker {
    fn default() -> Self {
        Self::new(None)
    }
}
