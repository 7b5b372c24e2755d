//! Observables and their subscriber sets.
//!
//! An observable holds the current encoded value of one watchable thing and
//! the `(session, wid)` pairs subscribed to it. Every value sent is encoded
//! once and shared by all queued records.

use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use serde_json::Value;

use super::EventError;

/// Client-chosen subscription id, scoped to one session.
pub type Wid = u64;

/// One message queued for a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub wid: Wid,
    /// Encoded JSON value.
    pub data: Arc<str>,
}

/// A watcher's mailbox entry for one subscription.
#[derive(Clone)]
pub struct Subscriber {
    pub sid: Arc<str>,
    pub wid: Wid,
    pub tx: Sender<Record>,
}

impl Subscriber {
    fn same(&self, sid: &str, wid: Wid) -> bool {
        self.wid == wid && &*self.sid == sid
    }

    /// Queue `data`. A disconnected watcher is ignored: it unsubscribes
    /// itself when its stream ends.
    pub fn send(&self, data: &Arc<str>) {
        let _ = self.tx.send(Record {
            wid: self.wid,
            data: Arc::clone(data),
        });
    }
}

/// Subscriber set, in subscription order.
#[derive(Default)]
pub struct Subscribers(Vec<Subscriber>);

impl Subscribers {
    /// Add `sub`, replacing an existing entry for the same `(sid, wid)`.
    pub fn insert(&mut self, sub: Subscriber) {
        match self.0.iter_mut().find(|s| s.same(&sub.sid, sub.wid)) {
            Some(existing) => *existing = sub,
            None => self.0.push(sub),
        }
    }

    pub fn remove(&mut self, sid: &str, wid: Wid) -> bool {
        let before = self.0.len();
        self.0.retain(|s| !s.same(sid, wid));
        self.0.len() != before
    }

    pub fn send(&self, data: &Arc<str>) {
        for sub in &self.0 {
            sub.send(data);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A named unit of watchable state.
///
/// `subscribe` must deliver the current value to the new subscriber before
/// returning, under the same lock that serializes later changes, so the
/// initial message always precedes any update.
pub trait Observable: Send + Sync {
    /// Load the current value before the first subscriber arrives. Called
    /// without the hub's registry lock held, so slow sources only delay
    /// their own caller.
    fn prime(&self) -> Result<(), EventError> {
        Ok(())
    }

    fn subscribe(&self, sub: Subscriber) -> Result<(), EventError>;

    /// Returns whether the subscriber was present.
    fn unsubscribe(&self, sid: &str, wid: Wid) -> bool;

    fn subscriber_count(&self) -> usize;
}

/// Encode a value for the wire.
pub fn encode(value: &Value) -> Arc<str> {
    Arc::from(value.to_string())
}

/// In-memory value, sent on change only.
pub struct ValueObservable {
    state: Mutex<ValueState>,
}

struct ValueState {
    value: Value,
    encoded: Arc<str>,
    subscribers: Subscribers,
}

impl ValueObservable {
    pub fn new(value: Value) -> Self {
        Self {
            state: Mutex::new(ValueState {
                encoded: encode(&value),
                value,
                subscribers: Subscribers::default(),
            }),
        }
    }

    /// Replace the value. Subscribers are notified only if it changed;
    /// returns whether it did.
    pub fn set(&self, value: Value) -> bool {
        let mut state = self.state.lock();
        if state.value == value {
            return false;
        }
        let encoded = encode(&value);
        state.subscribers.send(&encoded);
        state.encoded = encoded;
        state.value = value;
        true
    }

    #[cfg(test)]
    pub fn get(&self) -> Value {
        self.state.lock().value.clone()
    }
}

impl Observable for ValueObservable {
    fn subscribe(&self, sub: Subscriber) -> Result<(), EventError> {
        let mut state = self.state.lock();
        sub.send(&state.encoded);
        state.subscribers.insert(sub);
        Ok(())
    }

    fn unsubscribe(&self, sid: &str, wid: Wid) -> bool {
        self.state.lock().subscribers.remove(sid, wid)
    }

    fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{Receiver, unbounded};
    use serde_json::json;

    fn subscriber(sid: &str, wid: Wid) -> (Subscriber, Receiver<Record>) {
        let (tx, rx) = unbounded();
        let sub = Subscriber {
            sid: Arc::from(sid),
            wid,
            tx,
        };
        (sub, rx)
    }

    fn drain(rx: &Receiver<Record>) -> Vec<String> {
        rx.try_iter().map(|r| r.data.to_string()).collect()
    }

    #[test]
    fn test_subscribe_sends_initial_value() {
        let obs = ValueObservable::new(json!("v1"));
        let (sub, rx) = subscriber("s", 3);
        obs.subscribe(sub).unwrap();

        let record = rx.try_recv().unwrap();
        assert_eq!(record.wid, 3);
        assert_eq!(&*record.data, "\"v1\"");
        assert_eq!(obs.subscriber_count(), 1);
    }

    #[test]
    fn test_set_same_value_sends_once() {
        let obs = ValueObservable::new(json!(null));
        let (sub, rx) = subscriber("s", 1);
        obs.subscribe(sub).unwrap();
        drain(&rx);

        assert!(obs.set(json!("123")));
        assert!(!obs.set(json!("123")));
        assert_eq!(drain(&rx), vec!["\"123\""]);
        assert_eq!(obs.get(), json!("123"));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let obs = ValueObservable::new(json!(1));
        let (a, rx_a) = subscriber("a", 1);
        let (b, rx_b) = subscriber("b", 1);
        obs.subscribe(a).unwrap();
        obs.subscribe(b).unwrap();
        drain(&rx_a);
        drain(&rx_b);

        assert!(obs.unsubscribe("a", 1));
        assert!(!obs.unsubscribe("a", 1));
        obs.set(json!(2));

        assert!(drain(&rx_a).is_empty());
        assert_eq!(drain(&rx_b), vec!["2"]);
    }

    #[test]
    fn test_resubscribe_same_wid_replaces() {
        let mut subs = Subscribers::default();
        let (first, _rx1) = subscriber("s", 1);
        let (second, rx2) = subscriber("s", 1);
        subs.insert(first);
        subs.insert(second);
        assert_eq!(subs.len(), 1);

        subs.send(&Arc::from("x"));
        assert_eq!(drain(&rx2), vec!["x"]);
    }

    #[test]
    fn test_send_to_closed_watcher_is_ignored() {
        let obs = ValueObservable::new(json!(0));
        let (sub, rx) = subscriber("s", 1);
        obs.subscribe(sub).unwrap();
        drop(rx);
        assert!(obs.set(json!(1)));
    }
}
