//! Event hub: the registry behind the `/_events` endpoints.
//!
//! # Architecture
//!
//! ```text
//!  BuildScheduler ──set──► ValueObservable ─┐
//!                                            ├─► Subscriber (sid, wid, tx) ──► Watcher mailbox ──► stream
//!  Dispatcher ──wake──► DbObservable poller ─┘
//! ```
//!
//! Observables are created on first subscription, keyed by the hash of the
//! request descriptor, and dropped from the registry when their last
//! subscriber leaves. Watchers refer to observables by key only.
//!
//! # Lock order
//!
//! watcher subscriptions → observable registry → observable state → mailbox.
//! First loads of new observables run before the watcher lock is taken.

mod db;
pub mod descriptor;
pub mod observable;
pub mod protocol;
mod watcher;


pub use db::{DbObservable, PollQuery, Query, SolutionsQuery};
pub use descriptor::{Descriptor, Key, RequestContext};
pub use observable::{Observable, Record, Subscriber, ValueObservable, Wid};
pub use watcher::{Watcher, generate_session_id};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{
    debug,
    store::{Store, StoreError},
};
use protocol::WatchEntry;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("session not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where observables get their data.
pub struct Sources {
    /// Identifier of the build being served.
    pub build: Arc<ValueObservable>,
    pub store: Store,
    /// Re-read interval of store-backed observables.
    pub tick: Duration,
}

pub struct EventHub {
    observables: Mutex<FxHashMap<Key, Arc<dyn Observable>>>,
    watchers: Mutex<FxHashMap<Arc<str>, Arc<Watcher>>>,
    sources: Sources,
    last_activity: Mutex<Instant>,
}

impl EventHub {
    pub fn new(sources: Sources) -> Self {
        Self {
            observables: Mutex::new(FxHashMap::default()),
            watchers: Mutex::new(FxHashMap::default()),
            sources,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn build_observable(&self) -> &Arc<ValueObservable> {
        &self.sources.build
    }

    /// Open a new session under a fresh, unused session id.
    pub fn register_watcher(&self) -> Arc<Watcher> {
        let mut watchers = self.watchers.lock();
        let sid = loop {
            let sid = generate_session_id();
            if !watchers.contains_key(sid.as_str()) {
                break sid;
            }
        };
        let watcher = Arc::new(Watcher::new(sid));
        watchers.insert(Arc::from(watcher.sid()), Arc::clone(&watcher));
        drop(watchers);

        self.touch();
        debug!("events"; "session {} opened", watcher.sid());
        watcher
    }

    pub fn watcher(&self, sid: &str) -> Result<Arc<Watcher>, EventError> {
        self.watchers
            .lock()
            .get(sid)
            .cloned()
            .ok_or(EventError::NotFound)
    }

    /// Subscribe `watcher` to every entry. Returns the wids that failed;
    /// one failure does not affect the others. A wid already in use is
    /// re-pointed at the new descriptor.
    ///
    /// Observables not yet in the registry load their first value before
    /// any lock is taken, so a slow store read never stalls other sessions.
    pub fn watch(
        &self,
        watcher: &Watcher,
        entries: &[WatchEntry],
        ctx: &RequestContext,
    ) -> Result<Vec<Wid>, EventError> {
        let mut failed = Vec::new();
        let mut ready = Vec::with_capacity(entries.len());
        for entry in entries {
            let desc = match Descriptor::from_request(&entry.req, ctx) {
                Ok(desc) => desc,
                Err(e) => {
                    debug!("events"; "wid {} rejected: {}", entry.wid, e);
                    failed.push(entry.wid);
                    continue;
                }
            };
            let key = desc.key();
            let fresh = if self.observables.lock().contains_key(&key) {
                None
            } else {
                let observable = self.create(&desc);
                if let Err(e) = observable.prime() {
                    debug!("events"; "wid {} cannot load: {}", entry.wid, e);
                    failed.push(entry.wid);
                    continue;
                }
                Some(observable)
            };
            ready.push((entry.wid, desc, key, fresh));
        }

        let mut subs = watcher.subscriptions();
        if subs.closed {
            return Err(EventError::NotFound);
        }

        for (wid, desc, key, fresh) in ready {
            if let Some(old) = subs.map.remove(&wid) {
                self.release(&old, watcher.sid(), wid);
            }

            let mut observables = self.observables.lock();
            let observable = match observables.get(&key) {
                Some(existing) => Arc::clone(existing),
                None => {
                    // Dropped since the check above; subscribe loads on demand
                    let observable = fresh.unwrap_or_else(|| self.create(&desc));
                    observables.insert(key.clone(), Arc::clone(&observable));
                    observable
                }
            };

            match observable.subscribe(watcher.subscriber(wid)) {
                Ok(()) => {
                    subs.map.insert(wid, key);
                }
                Err(e) => {
                    debug!("events"; "wid {} subscribe failed: {}", wid, e);
                    if observable.subscriber_count() == 0 {
                        observables.remove(&key);
                    }
                    failed.push(wid);
                }
            }
        }
        Ok(failed)
    }

    /// Drop the given subscriptions. Unknown wids are ignored.
    pub fn unwatch(&self, watcher: &Watcher, wids: &[Wid]) {
        let mut subs = watcher.subscriptions();
        for wid in wids {
            if let Some(key) = subs.map.remove(wid) {
                self.release(&key, watcher.sid(), *wid);
            }
        }
    }

    /// End a session, releasing every subscription it holds.
    pub fn close(&self, watcher: &Watcher) {
        self.watchers.lock().remove(watcher.sid());

        let held = {
            let mut subs = watcher.subscriptions();
            subs.closed = true;
            let held: Vec<_> = subs.map.drain().collect();
            // Release under the watcher lock so a concurrent watch() cannot
            // slip a subscription in between.
            for (wid, key) in &held {
                self.release(key, watcher.sid(), *wid);
            }
            held.len()
        };

        self.touch();
        debug!("events"; "session {} closed ({} subscriptions)", watcher.sid(), held);
    }

    fn release(&self, key: &Key, sid: &str, wid: Wid) {
        let mut observables = self.observables.lock();
        if let Some(observable) = observables.get(key) {
            observable.unsubscribe(sid, wid);
            if observable.subscriber_count() == 0 {
                observables.remove(key);
            }
        }
    }

    fn create(&self, desc: &Descriptor) -> Arc<dyn Observable> {
        let sources = &self.sources;
        match desc {
            Descriptor::Build => Arc::clone(&sources.build) as Arc<dyn Observable>,
            Descriptor::Poll { origin, id } => Arc::new(DbObservable::new(
                PollQuery {
                    origin: origin.clone(),
                    id: id.clone(),
                },
                sources.store.clone(),
                sources.tick,
            )),
            Descriptor::Solutions { page } => Arc::new(DbObservable::new(
                SolutionsQuery { page: page.clone() },
                sources.store.clone(),
                sources.tick,
            )),
        }
    }

    /// Record client activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// How long the server has had no client. Zero while any session is open.
    pub fn idle_for(&self) -> Duration {
        if !self.watchers.lock().is_empty() {
            return Duration::ZERO;
        }
        self.last_activity.lock().elapsed()
    }

    #[cfg(test)]
    pub fn observable_count(&self) -> usize {
        self.observables.lock().len()
    }

    #[cfg(test)]
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }
}
