//! Minimal ring for disaster logging.
//!
//! Keeps only the keys needed to read a record back and caps the message
//! length, so the ring stays small enough to be always available.

use syslogd_core::{keys, Direction, LogRecord, Query};

use crate::memory::RingStore;
use crate::{LogStore, QueryResult, Reader, StoreError, StoreKind};

/// Byte cap of the mini ring, far below the regular memory ring.
pub const MINI_MAX_BYTES: usize = 64 * 1024;
/// Longest message kept.
pub const MINI_MESSAGE_MAX: usize = 1024;

const KEPT_KEYS: [&str; 12] = [
    keys::MESSAGE_ID,
    keys::TIME,
    keys::HOST,
    keys::SENDER,
    keys::PID,
    keys::UID,
    keys::GID,
    keys::LEVEL,
    keys::FACILITY,
    keys::MESSAGE,
    keys::READ_UID,
    keys::READ_GID,
];

#[derive(Debug)]
pub struct MiniStore {
    ring: RingStore,
}

impl MiniStore {
    pub fn new(max_records: usize) -> Self {
        Self {
            ring: RingStore::with_kind(StoreKind::Mini, max_records, MINI_MAX_BYTES),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn resize(&mut self, max_records: usize) {
        self.ring.resize(max_records, MINI_MAX_BYTES);
    }
}

/// The reduced form of `record` kept by the mini ring.
pub fn reduce(record: &LogRecord) -> LogRecord {
    let mut out = LogRecord::new();
    for key in KEPT_KEYS {
        if let Some(value) = record.get(key) {
            if key == keys::MESSAGE && value.len() > MINI_MESSAGE_MAX {
                let mut end = MINI_MESSAGE_MAX;
                while !value.is_char_boundary(end) {
                    end -= 1;
                }
                out.set(key, &value[..end]);
            } else {
                out.set(key, value);
            }
        }
    }
    out
}

impl LogStore for MiniStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Mini
    }

    fn open(&mut self) -> Result<(), StoreError> {
        self.ring.open()
    }

    fn close(&mut self) {
        self.ring.close()
    }

    fn is_open(&self) -> bool {
        self.ring.is_open()
    }

    fn save(&mut self, record: &LogRecord) -> Result<u64, StoreError> {
        self.ring.save(&reduce(record))
    }

    fn query(
        &self,
        query: &Query,
        start_id: u64,
        count: usize,
        direction: Direction,
        reader: Reader,
    ) -> Result<QueryResult, StoreError> {
        self.ring.query(query, start_id, count, direction, reader)
    }

    fn statistics(&self) -> LogRecord {
        self.ring.statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_extension_keys_and_truncates_message() {
        let long = "x".repeat(MINI_MESSAGE_MAX + 10);
        let record = LogRecord::from_pairs([
            (keys::MESSAGE_ID, "7"),
            (keys::SENDER, "kernel"),
            ("CustomKey", "dropped"),
            (keys::MESSAGE, long.as_str()),
        ]);
        let mut mini = MiniStore::new(4);
        mini.save(&record).unwrap();
        let page = mini
            .query(&Query::all(), 0, 0, Direction::Forward, Reader::ROOT)
            .unwrap();
        let stored = &page.records[0];
        assert!(!stored.contains("CustomKey"));
        assert_eq!(stored.message().map(str::len), Some(MINI_MESSAGE_MAX));
        assert_eq!(stored.id(), Some(7));
        assert_eq!(mini.statistics().get("Store"), Some("mini"));
    }
}
