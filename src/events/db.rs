//! Store-backed observables.
//!
//! A [`DbObservable`] runs one poller thread while it has subscribers. The
//! poller re-reads its [`Query`] whenever the dispatcher reports a change to
//! the query's notification key, and at least once per tick otherwise. A
//! value is sent only when it differs from the last one sent.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{Value, json};

use super::{
    EventError,
    observable::{Observable, Subscriber, Subscribers, Wid, encode},
};
use crate::{
    debug, log,
    store::{Store, StoreError, Waker, polls, solutions},
};

/// A read against the store whose result clients can watch.
pub trait Query: Send + Sync + 'static {
    /// Notification key bumped by writers of the data this query reads.
    fn notification_key(&self) -> String;

    fn read(&self, conn: &Connection) -> Result<Value, StoreError>;
}

/// Vote tally of one poll.
pub struct PollQuery {
    pub origin: String,
    pub id: String,
}

impl Query for PollQuery {
    fn notification_key(&self) -> String {
        polls::poll_key(&self.origin, &self.id)
    }

    fn read(&self, conn: &Connection) -> Result<Value, StoreError> {
        polls::results(conn, &self.origin, &self.id)
    }
}

/// Solution visibility of one page.
pub struct SolutionsQuery {
    pub page: String,
}

impl Query for SolutionsQuery {
    fn notification_key(&self) -> String {
        solutions::solutions_key(&self.page)
    }

    fn read(&self, conn: &Connection) -> Result<Value, StoreError> {
        Ok(json!({ "show": solutions::is_visible(conn, &self.page)? }))
    }
}

pub struct DbObservable<Q: Query> {
    shared: Arc<Shared<Q>>,
}

struct Shared<Q> {
    query: Q,
    store: Store,
    tick: Duration,
    state: Mutex<DbState>,
    /// Bumped on every stop; a poller exits once it no longer matches.
    generation: AtomicU64,
}

#[derive(Default)]
struct DbState {
    last: Option<(Value, Arc<str>)>,
    subscribers: Subscribers,
    poller: Option<Arc<Waker>>,
}

impl<Q: Query> DbObservable<Q> {
    pub fn new(query: Q, store: Store, tick: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                query,
                store,
                tick,
                state: Mutex::new(DbState::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    #[cfg(test)]
    /// Whether a poller thread is currently attached.
    pub fn is_polling(&self) -> bool {
        self.shared.state.lock().poller.is_some()
    }
}

impl<Q: Query> Shared<Q> {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Send `value` if it changed and this poller is still current.
    fn publish(&self, generation: u64, value: Value) {
        let mut state = self.state.lock();
        if !self.is_current(generation) {
            return;
        }
        if state.last.as_ref().is_some_and(|(last, _)| *last == value) {
            return;
        }
        let encoded = encode(&value);
        state.subscribers.send(&encoded);
        state.last = Some((value, encoded));
    }

    fn stop_locked(&self, state: &mut DbState) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        state.last = None;
        if let Some(waker) = state.poller.take() {
            waker.wake();
        }
    }

    /// Cached value, reading the store when there is none.
    fn current_locked(&self, state: &mut DbState) -> Result<Arc<str>, EventError> {
        if let Some((_, encoded)) = &state.last {
            return Ok(Arc::clone(encoded));
        }
        let conn = self.store.connect()?;
        let value = self.query.read(&conn)?;
        let encoded = encode(&value);
        state.last = Some((value, Arc::clone(&encoded)));
        Ok(encoded)
    }
}

/// Start a poller unless one is attached. A failed spawn is retried by the
/// next subscriber.
fn ensure_poller_locked<Q: Query>(shared: &Arc<Shared<Q>>, state: &mut DbState) {
    if state.poller.is_some() {
        return;
    }
    let generation = shared.generation.load(Ordering::Acquire);
    let waker = Arc::new(Waker::new(Some(shared.tick)));
    let poller = Arc::clone(shared);
    let thread_waker = Arc::clone(&waker);
    let spawned = thread::Builder::new()
        .name("poller".into())
        .spawn(move || poll(&poller, generation, &thread_waker));
    match spawned {
        Ok(_) => state.poller = Some(waker),
        Err(e) => log!("events"; "cannot start poller: {}", e),
    }
}

impl<Q: Query> Observable for DbObservable<Q> {
    fn prime(&self) -> Result<(), EventError> {
        let mut state = self.shared.state.lock();
        self.shared.current_locked(&mut state).map(|_| ())
    }

    fn subscribe(&self, sub: Subscriber) -> Result<(), EventError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        let encoded = shared.current_locked(&mut state)?;
        sub.send(&encoded);
        state.subscribers.insert(sub);
        ensure_poller_locked(shared, &mut state);
        Ok(())
    }

    fn unsubscribe(&self, sid: &str, wid: Wid) -> bool {
        let mut state = self.shared.state.lock();
        let removed = state.subscribers.remove(sid, wid);
        if removed && state.subscribers.is_empty() {
            self.shared.stop_locked(&mut state);
        }
        removed
    }

    fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }
}

fn poll<Q: Query>(shared: &Shared<Q>, generation: u64, waker: &Arc<Waker>) {
    let key = shared.query.notification_key();
    let conn = match shared.store.connect() {
        Ok(conn) => conn,
        Err(e) => {
            log!("events"; "poller for `{}` cannot connect: {}", key, e);
            return;
        }
    };
    if let Err(e) = shared.store.register(&conn, &key, waker) {
        debug!("events"; "register `{}` failed, relying on ticks: {}", key, e);
    }
    debug!("events"; "poller started for `{}`", key);

    while shared.is_current(generation) {
        match shared.query.read(&conn) {
            Ok(value) => shared.publish(generation, value),
            Err(e) => log!("events"; "poll `{}` failed: {}", key, e),
        }
        let until = Instant::now() + shared.tick;
        waker.wait(|| !shared.is_current(generation), Some(until));
    }

    shared.store.unregister(&key, waker);
    debug!("events"; "poller stopped for `{}`", key);
}
