//! Live-tail registrations.
//!
//! A watcher is a query, the reader it runs as, and the sending half of its
//! session's event channel. The set lives beside the store set under the
//! storage lock, so a registration's backlog and the records published after
//! it never overlap or leave a gap.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use syslogd_core::{LogRecord, Query};
use syslogd_store::Reader;

pub type WatchId = u64;
pub type SessionId = u64;

/// Events a session may leave unread before its watchers are dropped.
pub const WATCH_QUEUE_DEPTH: usize = 1024;

/// The per-session event channel watchers publish into.
pub fn event_channel() -> (mpsc::Sender<WatchEvent>, mpsc::Receiver<WatchEvent>) {
    mpsc::channel(WATCH_QUEUE_DEPTH)
}

/// One record pushed to a watcher.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub watch_id: WatchId,
    pub record: Arc<LogRecord>,
}

struct Watcher {
    session: SessionId,
    query: Query,
    reader: Reader,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
pub struct WatchSet {
    watchers: BTreeMap<WatchId, Watcher>,
    next_id: WatchId,
}

impl std::fmt::Debug for WatchSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSet")
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        session: SessionId,
        query: Query,
        reader: Reader,
        tx: mpsc::Sender<WatchEvent>,
    ) -> WatchId {
        self.next_id += 1;
        let id = self.next_id;
        self.watchers.insert(
            id,
            Watcher {
                session,
                query,
                reader,
                tx,
            },
        );
        id
    }

    /// Remove one watcher, but only on behalf of the session that owns it.
    pub fn remove(&mut self, session: SessionId, id: WatchId) -> bool {
        match self.watchers.get(&id) {
            Some(w) if w.session == session => self.watchers.remove(&id).is_some(),
            _ => false,
        }
    }

    /// Drop every watcher a session registered. Returns how many went.
    pub fn remove_session(&mut self, session: SessionId) -> usize {
        let before = self.watchers.len();
        self.watchers.retain(|_, w| w.session != session);
        before - self.watchers.len()
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Push a stored record to every watcher that matches and may read it.
    /// A watcher whose receiver is gone, or whose session has stopped
    /// draining its queue, is removed on the spot.
    pub fn publish(&mut self, record: &Arc<LogRecord>) -> usize {
        let mut sent = 0;
        self.watchers.retain(|id, w| {
            if !record.readable_by(w.reader.uid, w.reader.gid) || !w.query.matches(record) {
                return true;
            }
            let event = WatchEvent {
                watch_id: *id,
                record: Arc::clone(record),
            };
            match w.tx.try_send(event) {
                Ok(()) => {
                    sent += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        watch_id = *id,
                        session = w.session,
                        "watcher not keeping up, removing"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(watch_id = *id, "watcher gone, removing");
                    false
                }
            }
        });
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syslogd_core::keys;

    fn record(sender: &str) -> Arc<LogRecord> {
        Arc::new(LogRecord::from_pairs([(keys::SENDER, sender)]))
    }

    #[test]
    fn publish_filters_by_query_and_acl() {
        let mut set = WatchSet::new();
        let (tx, mut rx) = mpsc::channel(8);
        let query = Query::parse("[= Sender foo]").expect("query");
        let id = set.add(1, query, Reader::new(501, 20), tx);

        assert_eq!(set.publish(&record("bar")), 0);
        assert_eq!(set.publish(&record("foo")), 1);
        let mut private = LogRecord::from_pairs([(keys::SENDER, "foo")]);
        private.set(keys::READ_UID, "0");
        assert_eq!(set.publish(&Arc::new(private)), 0);

        let event = rx.try_recv().expect("event");
        assert_eq!(event.watch_id, id);
        assert_eq!(event.record.sender(), Some("foo"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dead_receivers_are_dropped_on_publish() {
        let mut set = WatchSet::new();
        let (tx, rx) = mpsc::channel(8);
        set.add(1, Query::all(), Reader::ROOT, tx);
        drop(rx);
        assert_eq!(set.publish(&record("foo")), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn a_watcher_that_stops_reading_is_dropped() {
        let mut set = WatchSet::new();
        let (tx, mut rx) = mpsc::channel(2);
        set.add(1, Query::all(), Reader::ROOT, tx);
        assert_eq!(set.publish(&record("a")), 1);
        assert_eq!(set.publish(&record("b")), 1);
        assert_eq!(set.publish(&record("c")), 0);
        assert!(set.is_empty());

        assert_eq!(rx.try_recv().expect("a").record.sender(), Some("a"));
        assert_eq!(rx.try_recv().expect("b").record.sender(), Some("b"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sessions_only_cancel_their_own() {
        let mut set = WatchSet::new();
        let (tx, _rx) = mpsc::channel(8);
        let a = set.add(1, Query::all(), Reader::ROOT, tx.clone());
        set.add(1, Query::all(), Reader::ROOT, tx.clone());
        set.add(2, Query::all(), Reader::ROOT, tx);

        assert!(!set.remove(2, a));
        assert!(set.remove(1, a));
        assert_eq!(set.remove_session(1), 1);
        assert_eq!(set.len(), 1);
    }
}
