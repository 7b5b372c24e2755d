//! In-process fan-in of "key changed" events.
//!
//! Two sources feed the dispatcher:
//! - commits in this process push `(key, seq)` pairs into the queue
//! - an optional periodic `notifications()` read catches writes made by other
//!   processes
//!
//! Either way, a key's wakers fire only when the observed sequence is
//! [`newer`](super::newer) than the last one seen for that key, so bursts of
//! changes coalesce into one wake-up.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use rustc_hash::FxHashMap;

use super::{Store, StoreError, Waker, newer, notifications};
use crate::{debug, log};

/// Wakers registered for one key, plus the last sequence seen for it.
#[derive(Default)]
struct WakerSet {
    seq: Option<u32>,
    wakers: Vec<Arc<Waker>>,
}

#[derive(Default)]
struct DispatchState {
    wakers: FxHashMap<String, WakerSet>,
    pending: Vec<(String, u32)>,
    shutdown: bool,
}

/// Shared state between committers, registrants and the dispatcher thread.
pub(crate) struct DispatchQueue {
    state: Mutex<DispatchState>,
    cond: Condvar,
}

impl DispatchQueue {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(DispatchState::default()),
            cond: Condvar::new(),
        }
    }

    pub(super) fn register(
        &self,
        conn: &Connection,
        key: &str,
        waker: &Arc<Waker>,
    ) -> Result<Option<u32>, StoreError> {
        let mut state = self.state.lock();
        if !state.wakers.contains_key(key) {
            // Seed under the lock: a commit racing with this read is either
            // visible here or lands in `pending` afterwards.
            let seq = notifications(conn, &[key])?.get(key).copied();
            state.wakers.insert(
                key.to_owned(),
                WakerSet {
                    seq,
                    wakers: Vec::new(),
                },
            );
        }

        let Some(set) = state.wakers.get_mut(key) else {
            return Ok(None);
        };
        if !set.wakers.iter().any(|w| Arc::ptr_eq(w, waker)) {
            set.wakers.push(Arc::clone(waker));
        }
        waker.seed(set.seq);
        Ok(set.seq)
    }

    pub(super) fn unregister(&self, key: &str, waker: &Arc<Waker>) {
        let mut state = self.state.lock();
        if let Some(set) = state.wakers.get_mut(key) {
            set.wakers.retain(|w| !Arc::ptr_eq(w, waker));
            if set.wakers.is_empty() {
                state.wakers.remove(key);
            }
        }
    }

    pub(super) fn push(&self, changes: impl IntoIterator<Item = (String, u32)>) {
        let mut state = self.state.lock();
        state.pending.extend(changes);
        self.cond.notify_all();
    }

    fn request_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }

    fn registered_keys(&self) -> Vec<String> {
        self.state.lock().wakers.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn take_pending(&self) -> Vec<(String, u32)> {
        std::mem::take(&mut self.state.lock().pending)
    }
}

/// Advance each key's last-seen sequence and collect the wakers to fire.
fn reconcile(
    wakers: &mut FxHashMap<String, WakerSet>,
    changes: impl IntoIterator<Item = (String, u32)>,
    to_wake: &mut Vec<(Arc<Waker>, u32)>,
) {
    for (key, seq) in changes {
        let Some(set) = wakers.get_mut(&key) else {
            continue;
        };
        if !newer(seq, set.seq) {
            continue;
        }
        set.seq = Some(seq);
        for waker in &set.wakers {
            match to_wake.iter_mut().find(|(w, _)| Arc::ptr_eq(w, waker)) {
                Some(entry) => entry.1 = seq,
                None => to_wake.push((Arc::clone(waker), seq)),
            }
        }
    }
}

/// Handle to the dispatcher thread. Dropping it stops the thread.
pub struct Dispatcher {
    store: Store,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start the dispatcher for `store`.
    ///
    /// With `poll_interval` set, registered keys are also re-read from the
    /// database at that interval to pick up writes from other processes.
    pub fn spawn(store: Store, poll_interval: Option<Duration>) -> std::io::Result<Self> {
        let thread_store = store.clone();
        let handle = thread::Builder::new()
            .name("dispatch".into())
            .spawn(move || run(&thread_store, poll_interval))?;
        Ok(Self {
            store,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.store.queue().request_shutdown();
        if handle.join().is_err() {
            log!("dispatch"; "dispatcher thread panicked");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(store: &Store, poll_interval: Option<Duration>) {
    let queue = store.queue();
    let conn = match poll_interval.map(|_| store.connect()).transpose() {
        Ok(conn) => conn,
        Err(e) => {
            log!("dispatch"; "polling disabled, cannot open store: {}", e);
            None
        }
    };
    let poll_interval = conn.as_ref().and(poll_interval);
    let mut next_poll = poll_interval.map(|p| Instant::now() + p);

    loop {
        let mut to_wake = Vec::new();
        let poll_due;
        {
            let mut state = queue.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if !state.pending.is_empty() {
                    break;
                }
                match next_poll {
                    Some(at) if Instant::now() >= at => break,
                    Some(at) => {
                        queue.cond.wait_until(&mut state, at);
                    }
                    None => queue.cond.wait(&mut state),
                }
            }

            let pending = std::mem::take(&mut state.pending);
            reconcile(&mut state.wakers, pending, &mut to_wake);
            poll_due = next_poll.is_some_and(|at| Instant::now() >= at);
        }

        if poll_due
            && let (Some(conn), Some(interval)) = (conn.as_ref(), poll_interval)
        {
            next_poll = Some(Instant::now() + interval);
            let keys = queue.registered_keys();
            if !keys.is_empty() {
                match notifications(conn, &keys) {
                    Ok(seqs) => {
                        let mut state = queue.state.lock();
                        reconcile(&mut state.wakers, seqs, &mut to_wake);
                    }
                    Err(e) => debug!("dispatch"; "poll failed: {}", e),
                }
            }
        }

        for (waker, seq) in to_wake {
            waker.wake_at(seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreSettings, Wake, test_store};

    fn bump(store: &Store, conn: &mut Connection, key: &str) -> u32 {
        let mut txn = store.transaction(conn).unwrap();
        let seq = txn.notify(&[key]).unwrap()[0];
        txn.commit().unwrap();
        seq
    }

    fn wait_for_seq(waker: &Waker, target: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if waker.seq() == Some(target) {
                return true;
            }
            waker.wait(|| false, Some(Instant::now() + Duration::from_millis(50)));
        }
        waker.seq() == Some(target)
    }

    #[test]
    fn test_register_seeds_existing_seq() {
        let (_dir, store) = test_store();
        let mut conn = store.connect().unwrap();
        bump(&store, &mut conn, "k");
        bump(&store, &mut conn, "k");
        store.queue().take_pending();

        let waker = Arc::new(Waker::default());
        assert_eq!(store.register(&conn, "k", &waker).unwrap(), Some(2));
        assert_eq!(waker.seq(), Some(2));

        let fresh = Arc::new(Waker::default());
        assert_eq!(store.register(&conn, "unseen", &fresh).unwrap(), None);
    }

    #[test]
    fn test_reconcile_coalesces_and_ignores_stale() {
        let waker = Arc::new(Waker::default());
        let mut wakers = FxHashMap::default();
        wakers.insert(
            "k".to_string(),
            WakerSet {
                seq: Some(5),
                wakers: vec![Arc::clone(&waker)],
            },
        );

        let mut to_wake = Vec::new();
        reconcile(
            &mut wakers,
            vec![("k".into(), 6), ("k".into(), 7), ("k".into(), 4), ("other".into(), 1)],
            &mut to_wake,
        );

        assert_eq!(to_wake.len(), 1);
        assert_eq!(to_wake[0].1, 7);
        assert_eq!(wakers["k"].seq, Some(7));
    }

    #[test]
    fn test_reconcile_across_wraparound() {
        let waker = Arc::new(Waker::default());
        let mut wakers = FxHashMap::default();
        wakers.insert(
            "k".to_string(),
            WakerSet {
                seq: Some(u32::MAX),
                wakers: vec![Arc::clone(&waker)],
            },
        );

        let mut to_wake = Vec::new();
        reconcile(&mut wakers, vec![("k".into(), 0)], &mut to_wake);
        assert_eq!(to_wake.len(), 1);
        assert_eq!(wakers["k"].seq, Some(0));
    }

    #[test]
    fn test_commits_wake_registered_waker() {
        let (_dir, store) = test_store();
        let mut conn = store.connect().unwrap();
        let n = bump(&store, &mut conn, "polls:o:p1");
        let mut dispatcher = Dispatcher::spawn(store.clone(), None).unwrap();

        let waker = Arc::new(Waker::default());
        store.register(&conn, "polls:o:p1", &waker).unwrap();
        assert_eq!(waker.seq(), Some(n));

        bump(&store, &mut conn, "polls:o:p1");
        bump(&store, &mut conn, "polls:o:p1");

        assert!(wait_for_seq(&waker, n + 2));
        dispatcher.shutdown();
    }

    #[test]
    fn test_unregistered_key_is_ignored() {
        let (_dir, store) = test_store();
        let mut conn = store.connect().unwrap();
        let _dispatcher = Dispatcher::spawn(store.clone(), None).unwrap();

        let waker = Arc::new(Waker::default());
        store.register(&conn, "a", &waker).unwrap();
        store.unregister("a", &waker);
        bump(&store, &mut conn, "a");

        let until = Instant::now() + Duration::from_millis(100);
        assert_eq!(waker.wait(|| false, Some(until)), Wake::TimedOut);
    }

    #[test]
    fn test_polling_sees_other_process_writes() {
        let (_dir, store) = test_store();
        let conn = store.connect().unwrap();
        let _dispatcher =
            Dispatcher::spawn(store.clone(), Some(Duration::from_millis(20))).unwrap();

        let waker = Arc::new(Waker::default());
        store.register(&conn, "solutions:/a/", &waker).unwrap();

        // A second handle has its own dispatch queue, like another process.
        let other = Store::open(store.path(), StoreSettings::default()).unwrap();
        let mut other_conn = other.connect().unwrap();
        let seq = bump(&other, &mut other_conn, "solutions:/a/");

        assert!(wait_for_seq(&waker, seq));
    }
}
