//! In-memory ring of full records.

use std::collections::VecDeque;

use syslogd_core::{Direction, LogRecord, Query};

use crate::{now_secs, select, LogStore, QueryResult, Reader, StoreError, StoreKind};

/// Fixed-capacity ring that evicts the oldest record when either the record
/// cap or the byte cap is exceeded.
#[derive(Debug)]
pub struct RingStore {
    kind: StoreKind,
    max_records: usize,
    max_bytes: usize,
    records: VecDeque<LogRecord>,
    bytes: usize,
    evicted: u64,
    open: bool,
}

impl RingStore {
    pub fn new(max_records: usize, max_bytes: usize) -> Self {
        Self::with_kind(StoreKind::Memory, max_records, max_bytes)
    }

    pub(crate) fn with_kind(kind: StoreKind, max_records: usize, max_bytes: usize) -> Self {
        Self {
            kind,
            max_records: max_records.max(1),
            max_bytes: max_bytes.max(1),
            records: VecDeque::new(),
            bytes: 0,
            evicted: 0,
            open: true,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Change the caps, evicting immediately if the ring is now over them.
    pub fn resize(&mut self, max_records: usize, max_bytes: usize) {
        self.max_records = max_records.max(1);
        self.max_bytes = max_bytes.max(1);
        self.evict();
    }

    fn evict(&mut self) {
        // The newest record always survives, even if it alone is over the
        // byte cap.
        while self.records.len() > 1
            && (self.records.len() > self.max_records || self.bytes > self.max_bytes)
        {
            if let Some(old) = self.records.pop_front() {
                self.bytes -= old.byte_size();
                self.evicted += 1;
            }
        }
    }
}

impl LogStore for RingStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn open(&mut self) -> Result<(), StoreError> {
        self.open = true;
        Ok(())
    }

    /// Closing a ring keeps its contents; only a new ring starts empty.
    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn save(&mut self, record: &LogRecord) -> Result<u64, StoreError> {
        if !self.open {
            return Err(StoreError::Closed(self.kind));
        }
        let id = record.id().unwrap_or(0);
        self.bytes += record.byte_size();
        self.records.push_back(record.clone());
        self.evict();
        Ok(id)
    }

    fn query(
        &self,
        query: &Query,
        start_id: u64,
        count: usize,
        direction: Direction,
        reader: Reader,
    ) -> Result<QueryResult, StoreError> {
        Ok(select(
            self.records.iter(),
            query,
            start_id,
            count,
            direction,
            reader,
            now_secs(),
        ))
    }

    fn statistics(&self) -> LogRecord {
        let mut stats = LogRecord::new();
        stats.set("Store", self.kind.name());
        stats.set("Records", self.records.len().to_string());
        stats.set("MaxRecords", self.max_records.to_string());
        stats.set("Bytes", self.bytes.to_string());
        stats.set("MaxBytes", self.max_bytes.to_string());
        stats.set("Evicted", self.evicted.to_string());
        if let Some(first) = self.records.front().and_then(LogRecord::id) {
            stats.set("FirstID", first.to_string());
        }
        if let Some(last) = self.records.back().and_then(LogRecord::id) {
            stats.set("LastID", last.to_string());
        }
        stats
    }
}
