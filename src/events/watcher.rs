//! Long-poll sessions.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::{Mutex, MutexGuard};
use rand::RngCore;
use rustc_hash::FxHashMap;

use super::{
    descriptor::Key,
    observable::{Record, Subscriber, Wid},
};

const SESSION_ID_BYTES: usize = 20;

/// Fresh unguessable session id: 20 random bytes, base64url without padding.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// One client's session: a mailbox shared by all its subscriptions.
pub struct Watcher {
    sid: Arc<str>,
    tx: Sender<Record>,
    rx: Receiver<Record>,
    subscriptions: Mutex<Subscriptions>,
}

/// Current `wid -> observable key` map. Once `closed`, no subscription may
/// be added.
#[derive(Default)]
pub(super) struct Subscriptions {
    pub map: FxHashMap<Wid, Key>,
    pub closed: bool,
}

impl Watcher {
    pub(super) fn new(sid: String) -> Self {
        let (tx, rx) = unbounded();
        Self {
            sid: Arc::from(sid),
            tx,
            rx,
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Mailbox handle for subscription `wid`.
    pub(super) fn subscriber(&self, wid: Wid) -> Subscriber {
        Subscriber {
            sid: Arc::clone(&self.sid),
            wid,
            tx: self.tx.clone(),
        }
    }

    pub(super) fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions.lock()
    }

    /// Next queued record, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Record, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Next queued record, if any, without waiting.
    pub fn try_recv(&self) -> Option<Record> {
        self.rx.try_recv().ok()
    }

    #[cfg(test)]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map.len()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.subscriptions.lock().closed
    }
}
