//! # syslogd-store
//!
//! Storage backends for log records.
//!
//! Every backend implements [`LogStore`]. Three are provided:
//! - [`FileStore`]: durable, one JSON-lines file per day plus `StoreData`
//! - [`RingStore`]: in-memory ring of full records with record and byte caps
//! - [`MiniStore`]: tiny ring of reduced records for disaster logging
//!
//! [`StoreSet`] owns the configured backends, assigns record ids and handles
//! close/reopen and fallback when a backend fails.

use std::fmt;

use syslogd_core::{Direction, LogRecord, Query};

pub mod error;
pub mod file;
pub mod memory;
pub mod mini;
pub mod set;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::RingStore;
pub use mini::MiniStore;
pub use set::StoreSet;

/// Which backend a store is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    File,
    Memory,
    Mini,
}

impl StoreKind {
    pub fn name(self) -> &'static str {
        match self {
            StoreKind::File => "file",
            StoreKind::Memory => "memory",
            StoreKind::Mini => "mini",
        }
    }

    pub fn parse(s: &str) -> Option<StoreKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Some(StoreKind::File),
            "memory" | "mem" => Some(StoreKind::Memory),
            "mini" => Some(StoreKind::Mini),
            _ => None,
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Credentials of the caller a query runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reader {
    pub uid: i64,
    pub gid: i64,
}

impl Reader {
    pub const ROOT: Reader = Reader { uid: 0, gid: 0 };

    pub fn new(uid: i64, gid: i64) -> Self {
        Self { uid, gid }
    }
}

/// A page of query results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub records: Vec<LogRecord>,
    /// Highest id returned for forward scans, lowest for reverse scans,
    /// 0 when nothing matched.
    pub last_id: u64,
}

/// A storage backend.
pub trait LogStore: Send {
    fn kind(&self) -> StoreKind;

    fn open(&mut self) -> Result<(), StoreError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Persist a record that already carries its `ASLMessageID`.
    fn save(&mut self, record: &LogRecord) -> Result<u64, StoreError>;

    /// Records matching `query` readable by `reader`, starting at `start_id`.
    ///
    /// Forward scans return ids `>= start_id` ascending; reverse scans return
    /// ids `<= start_id` descending (`0` means "from the newest"). A `count`
    /// of 0 means no limit.
    fn query(
        &self,
        query: &Query,
        start_id: u64,
        count: usize,
        direction: Direction,
        reader: Reader,
    ) -> Result<QueryResult, StoreError>;

    /// Counters describing the backend, as a record.
    fn statistics(&self) -> LogRecord;

    /// Periodic maintenance. `now` is seconds since the epoch.
    fn sweep(&mut self, _now: i64) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Select matching records from an id-ascending sequence.
pub(crate) fn select<'a, I>(
    records: I,
    query: &Query,
    start_id: u64,
    count: usize,
    direction: Direction,
    reader: Reader,
    now: i64,
) -> QueryResult
where
    I: DoubleEndedIterator<Item = &'a LogRecord>,
{
    let limit = if count == 0 { usize::MAX } else { count };
    let wanted = |r: &&LogRecord| {
        r.readable_by(reader.uid, reader.gid) && !is_expired(r, now) && query.matches(r)
    };
    let records: Vec<LogRecord> = match direction {
        Direction::Forward => records
            .filter(|r| r.id().unwrap_or(0) >= start_id)
            .filter(wanted)
            .take(limit)
            .cloned()
            .collect(),
        Direction::Reverse => {
            let start = if start_id == 0 { u64::MAX } else { start_id };
            records
                .rev()
                .filter(|r| r.id().unwrap_or(0) <= start)
                .filter(wanted)
                .take(limit)
                .cloned()
                .collect()
        }
    };
    let last_id = records.last().and_then(LogRecord::id).unwrap_or(0);
    QueryResult { records, last_id }
}

/// A record whose `ASLExpireTime` has passed is no longer returned.
pub(crate) fn is_expired(record: &LogRecord, now: i64) -> bool {
    record
        .get_parsed::<i64>(syslogd_core::keys::EXPIRE_TIME)
        .is_some_and(|t| t < now)
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
