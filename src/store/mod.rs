//! Sequence store: notification counters and persisted application state.
//!
//! SQLite (via `rusqlite`) holds one row per notification key with a `u32`
//! sequence counter. Writers bump counters inside their transaction with
//! [`Txn::notify`]; once the transaction commits, the `(key, seq)` pairs are
//! handed to the in-process dispatch queue, which wakes any [`Waker`]
//! registered for those keys.
//!
//! # Connections
//!
//! A connection is private to the thread that opened it. [`Store`] is a cheap
//! handle that knows how to open connections; every long-lived thread (the
//! dispatcher, each observable poller) calls [`Store::connect`] once and keeps
//! its own.
//!
//! ```text
//! writer ── Txn::notify ── commit ──► DispatchQueue ──► Dispatcher ──► Waker::wake
//!                                          ▲
//! other process ── commit ──► SQLite ──────┘ (periodic notifications() poll)
//! ```

mod dispatch;
mod migrations;
pub mod polls;
pub mod solutions;
mod waker;

pub use dispatch::Dispatcher;
pub use migrations::run_migrations;
pub use waker::{Wake, Waker};

use std::{
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rusqlite::{Connection, OpenFlags};
use rustc_hash::FxHashMap;
use thiserror::Error;

use dispatch::DispatchQueue;

/// SQLite's default bound on host parameters per statement is 999 (older builds).
const MAX_PARAMS: usize = 500;

/// Errors raised by the store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database directory `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("migration '{name}' failed: {source}")]
    Migration {
        name: &'static str,
        source: rusqlite::Error,
    },
}

/// Runtime tunables for store connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// Busy timeout applied to every connection.
    pub busy_timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Handle to the sequence store. Clones share the dispatch queue.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    settings: StoreSettings,
    queue: DispatchQueue,
}

impl Store {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub fn open(path: impl AsRef<Path>, settings: StoreSettings) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
        }

        let store = Self {
            inner: Arc::new(StoreInner {
                path,
                settings,
                queue: DispatchQueue::new(),
            }),
        };

        let conn = store.connect()?;
        let applied = run_migrations(&conn)?;
        if applied > 0 {
            crate::debug!("store"; "applied {} migration(s) to {}", applied, store.path().display());
        }
        Ok(store)
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Open a new connection for the calling thread.
    pub fn connect(&self) -> Result<Connection, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.inner.path, flags)?;

        // WAL lets pollers read while a writer holds the lock.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        conn.busy_timeout(self.inner.settings.busy_timeout)?;
        Ok(conn)
    }

    /// Begin a write transaction on `conn`.
    ///
    /// Keys passed to [`Txn::notify`] are dispatched only if the transaction
    /// commits.
    pub fn transaction<'c>(&self, conn: &'c mut Connection) -> Result<Txn<'c>, StoreError> {
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        Ok(Txn {
            tx,
            store: self.clone(),
            notified: FxHashMap::default(),
        })
    }

    /// Register `waker` for changes to `key`.
    ///
    /// The first registration of a key seeds its last-seen sequence number
    /// from a fresh read, so a change committed after this call returns is
    /// always observed. Returns the seeded (or already known) sequence.
    pub fn register(
        &self,
        conn: &Connection,
        key: &str,
        waker: &Arc<Waker>,
    ) -> Result<Option<u32>, StoreError> {
        self.inner.queue.register(conn, key, waker)
    }

    /// Remove a previously registered waker.
    pub fn unregister(&self, key: &str, waker: &Arc<Waker>) {
        self.inner.queue.unregister(key, waker);
    }

    /// Hand committed changes to the dispatcher.
    pub(crate) fn dispatch(&self, changes: impl IntoIterator<Item = (String, u32)>) {
        self.inner.queue.push(changes);
    }

    pub(crate) fn queue(&self) -> &DispatchQueue {
        &self.inner.queue
    }
}

/// A write transaction that tracks the notification keys it bumped.
pub struct Txn<'c> {
    tx: rusqlite::Transaction<'c>,
    store: Store,
    notified: FxHashMap<String, u32>,
}

impl Txn<'_> {
    /// Bump the counter of every key, returning the new sequence numbers in
    /// the same order. Calling this twice for a key increments it twice.
    pub fn notify<S: AsRef<str>>(&mut self, keys: &[S]) -> Result<Vec<u32>, StoreError> {
        let mut stmt = self.tx.prepare_cached(
            "INSERT INTO notifications (key, seq) VALUES (?1, 1)
             ON CONFLICT(key) DO UPDATE SET seq = (seq + 1) % 4294967296
             RETURNING seq",
        )?;

        let mut seqs = Vec::with_capacity(keys.len());
        for key in keys {
            let key = key.as_ref();
            let seq: i64 = stmt.query_row([key], |row| row.get(0))?;
            let seq = seq as u32;
            self.notified.insert(key.to_owned(), seq);
            seqs.push(seq);
        }
        Ok(seqs)
    }

    /// Commit, then dispatch the notified keys. A failed commit dispatches
    /// nothing.
    pub fn commit(self) -> Result<(), StoreError> {
        let Self {
            tx,
            store,
            notified,
        } = self;
        tx.commit()?;
        if !notified.is_empty() {
            store.dispatch(notified);
        }
        Ok(())
    }
}

impl Deref for Txn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

/// Read current sequence numbers. Keys without a row are absent from the
/// result.
pub fn notifications<S: AsRef<str>>(
    conn: &Connection,
    keys: &[S],
) -> Result<FxHashMap<String, u32>, StoreError> {
    let mut result = FxHashMap::default();
    for chunk in keys.chunks(MAX_PARAMS) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!("SELECT key, seq FROM notifications WHERE key IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(chunk.iter().map(AsRef::as_ref)),
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        for row in rows {
            let (key, seq) = row?;
            result.insert(key, seq as u32);
        }
    }
    Ok(result)
}

/// Whether sequence `a` is newer than `b`, tolerating wraparound at 2^32.
///
/// `a` is newer when `b` is unknown or `0 < (a - b) mod 2^32 <= 2^31`.
#[inline]
pub fn newer(a: u32, b: Option<u32>) -> bool {
    match b {
        None => true,
        Some(b) => {
            let diff = a.wrapping_sub(b);
            diff != 0 && diff <= 1 << 31
        }
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path().join("state.sqlite"), StoreSettings::default()).unwrap();
    (dir, store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(store: &Store) -> Vec<(String, u32)> {
        store.queue().take_pending()
    }

    #[test]
    fn test_newer_basic() {
        assert!(newer(1, None));
        assert!(newer(2, Some(1)));
        assert!(!newer(1, Some(1)));
        assert!(!newer(1, Some(2)));
    }

    #[test]
    fn test_newer_wraparound() {
        assert!(newer(0, Some(u32::MAX)));
        assert!(newer(5, Some(u32::MAX - 5)));
        assert!(!newer(u32::MAX, Some(0)));
        // Exactly half the ring away still counts as newer
        assert!(newer(1 << 31, Some(0)));
        assert!(!newer((1 << 31) + 1, Some(0)));
    }

    #[test]
    fn test_notify_increments() {
        let (_dir, store) = test_store();
        let mut conn = store.connect().unwrap();

        let mut txn = store.transaction(&mut conn).unwrap();
        assert_eq!(txn.notify(&["a"]).unwrap(), vec![1]);
        assert_eq!(txn.notify(&["a", "b"]).unwrap(), vec![2, 1]);
        txn.commit().unwrap();

        let seqs = notifications(&conn, &["a", "b", "missing"]).unwrap();
        assert_eq!(seqs.get("a"), Some(&2));
        assert_eq!(seqs.get("b"), Some(&1));
        assert!(!seqs.contains_key("missing"));
    }

    #[test]
    fn test_notify_wraps_at_u32() {
        let (_dir, store) = test_store();
        let mut conn = store.connect().unwrap();
        conn.execute(
            "INSERT INTO notifications (key, seq) VALUES ('k', ?1)",
            [i64::from(u32::MAX)],
        )
        .unwrap();

        let mut txn = store.transaction(&mut conn).unwrap();
        assert_eq!(txn.notify(&["k"]).unwrap(), vec![0]);
        txn.commit().unwrap();
    }

    #[test]
    fn test_commit_dispatches_last_seq() {
        let (_dir, store) = test_store();
        let mut conn = store.connect().unwrap();

        let mut txn = store.transaction(&mut conn).unwrap();
        txn.notify(&["polls:o:p1"]).unwrap();
        txn.notify(&["polls:o:p1"]).unwrap();
        assert!(pending(&store).is_empty());
        txn.commit().unwrap();

        assert_eq!(pending(&store), vec![("polls:o:p1".to_string(), 2)]);
    }

    #[test]
    fn test_rollback_dispatches_nothing() {
        let (_dir, store) = test_store();
        let mut conn = store.connect().unwrap();

        {
            let mut txn = store.transaction(&mut conn).unwrap();
            txn.notify(&["k"]).unwrap();
            // dropped without commit
        }

        assert!(pending(&store).is_empty());
        assert!(notifications(&conn, &["k"]).unwrap().is_empty());
    }

    #[test]
    fn test_notifications_batches_many_keys() {
        let (_dir, store) = test_store();
        let mut conn = store.connect().unwrap();
        let keys: Vec<String> = (0..1200).map(|i| format!("k{i}")).collect();

        let mut txn = store.transaction(&mut conn).unwrap();
        txn.notify(&keys).unwrap();
        txn.commit().unwrap();

        let seqs = notifications(&conn, &keys).unwrap();
        assert_eq!(seqs.len(), 1200);
        assert!(seqs.values().all(|&s| s == 1));
    }
}
