//! The configured set of backends.
//!
//! [`StoreSet`] assigns record ids, fans each save out to every active
//! backend, and handles failure: a failing backend is closed and reopened
//! once; if it still fails, the file backend falls back to the memory ring
//! and the memory ring falls back to the mini ring. The disaster ring is
//! always present and answers queries when nothing else can.

use std::path::{Path, PathBuf};

use syslogd_core::{keys, Direction, LevelMask, LogRecord, Params, Query, StoreKinds};

use crate::error::StoreError;
use crate::file::FileStore;
use crate::memory::RingStore;
use crate::mini::MiniStore;
use crate::{LogStore, QueryResult, Reader, StoreKind};

/// Records the disaster ring keeps.
pub const DISASTER_RECORDS: usize = 256;

pub struct StoreSet {
    dir: PathBuf,
    wanted: StoreKinds,
    file: Option<FileStore>,
    memory: Option<RingStore>,
    mini: Option<MiniStore>,
    disaster: MiniStore,
    filter: LevelMask,
    next_id: u64,
    saved: u64,
    filtered: u64,
    failures: u64,
}

impl StoreSet {
    /// Open the backends named by `params.db_type` under `dir`.
    ///
    /// Fails only if no backend at all can be opened.
    pub fn open(dir: &Path, params: &Params) -> Result<Self, StoreError> {
        let mut set = Self {
            dir: dir.to_path_buf(),
            wanted: params.db_type,
            file: None,
            memory: None,
            mini: None,
            disaster: MiniStore::new(DISASTER_RECORDS),
            filter: params.db_filter,
            next_id: 1,
            saved: 0,
            filtered: 0,
            failures: 0,
        };
        set.apply_params(params);
        if set.active_kinds().is_empty() {
            return Err(StoreError::Unavailable);
        }
        Ok(set)
    }

    /// Bring the backends in line with `params`, opening and closing as
    /// needed. Existing backends keep their contents.
    pub fn apply_params(&mut self, params: &Params) {
        self.wanted = params.db_type;
        self.filter = params.db_filter;

        if params.db_type.file {
            let mut file = self
                .file
                .take()
                .unwrap_or_else(|| FileStore::new(&self.dir, params.db_file_max, params.store_ttl));
            file.set_limits(params.db_file_max, params.store_ttl);
            if !file.is_open() {
                if let Err(e) = file.open() {
                    tracing::error!(dir = %self.dir.display(), error = %e, "file store unavailable, falling back to memory");
                    self.failures += 1;
                    self.ensure_memory(params);
                }
            }
            if file.is_open() {
                self.next_id = self.next_id.max(file.last_id() + 1);
                self.file = Some(file);
            }
        } else if let Some(mut file) = self.file.take() {
            file.close();
        }

        if params.db_type.memory {
            self.ensure_memory(params);
        } else if self.file.is_some() || params.db_type.mini {
            self.memory = None;
        }
        if let Some(memory) = &mut self.memory {
            memory.resize(params.db_memory_max, params.db_memory_str_max);
        }

        if params.db_type.mini {
            self.mini
                .get_or_insert_with(|| MiniStore::new(params.db_mini_max))
                .resize(params.db_mini_max);
        } else if self.file.is_some() || self.memory.is_some() {
            self.mini = None;
        }
    }

    fn ensure_memory(&mut self, params: &Params) {
        self.memory
            .get_or_insert_with(|| RingStore::new(params.db_memory_max, params.db_memory_str_max));
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Backends currently active (may differ from the configured set after
    /// a fallback).
    pub fn active_kinds(&self) -> Vec<StoreKind> {
        let mut kinds = Vec::new();
        if self.file.is_some() {
            kinds.push(StoreKind::File);
        }
        if self.memory.is_some() {
            kinds.push(StoreKind::Memory);
        }
        if self.mini.is_some() {
            kinds.push(StoreKind::Mini);
        }
        kinds
    }

    /// The configured backend selection.
    pub fn configured(&self) -> StoreKinds {
        self.wanted
    }

    /// Id the next saved record will get.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Highest id handed out so far.
    pub fn last_id(&self) -> u64 {
        self.next_id - 1
    }

    fn backend_mut(&mut self, kind: StoreKind) -> Option<&mut dyn LogStore> {
        match kind {
            StoreKind::File => self.file.as_mut().map(|s| s as &mut dyn LogStore),
            StoreKind::Memory => self.memory.as_mut().map(|s| s as &mut dyn LogStore),
            StoreKind::Mini => self.mini.as_mut().map(|s| s as &mut dyn LogStore),
        }
    }

    fn backend(&self, kind: StoreKind) -> Option<&dyn LogStore> {
        match kind {
            StoreKind::File => self.file.as_ref().map(|s| s as &dyn LogStore),
            StoreKind::Memory => self.memory.as_ref().map(|s| s as &dyn LogStore),
            StoreKind::Mini => self.mini.as_ref().map(|s| s as &dyn LogStore),
        }
    }

    /// Assign the next id to `record` and save it to every active backend.
    ///
    /// Returns the id, or `None` if the level filter excluded the record or
    /// every backend failed.
    pub fn save(&mut self, record: &mut LogRecord) -> Option<u64> {
        if !self.filter.contains(record.level()) {
            self.filtered += 1;
            return None;
        }
        let id = self.next_id;
        record.set(keys::MESSAGE_ID, id.to_string());

        let mut stored = false;
        for kind in self.active_kinds() {
            stored |= self.save_to(kind, record);
        }
        if !stored && self.active_kinds().is_empty() {
            // Everything fell over; the mini ring is the last resort.
            let mut mini = MiniStore::new(DISASTER_RECORDS);
            stored = mini.save(record).is_ok();
            self.mini = Some(mini);
        }
        if stored {
            self.next_id += 1;
            self.saved += 1;
            Some(id)
        } else {
            record.unset(keys::MESSAGE_ID);
            None
        }
    }

    /// Save to one backend: retry once after close/reopen, then fall back.
    fn save_to(&mut self, kind: StoreKind, record: &LogRecord) -> bool {
        let Some(store) = self.backend_mut(kind) else {
            return false;
        };
        let first = match store.save(record) {
            Ok(_) => return true,
            Err(e) => e,
        };
        tracing::warn!(store = %kind, error = %first, "save failed, reopening store");
        store.close();
        let retry = store.open().and_then(|()| store.save(record));
        let second = match retry {
            Ok(_) => return true,
            Err(e) => e,
        };
        self.failures += 1;
        tracing::error!(store = %kind, error = %second, "save failed after reopen, falling back");
        self.fall_back(kind, record)
    }

    fn fall_back(&mut self, failed: StoreKind, record: &LogRecord) -> bool {
        match failed {
            StoreKind::File => {
                self.file = None;
                if self.memory.is_some() {
                    // Memory comes after file in the save order.
                    return true;
                }
                let mut memory = RingStore::new(
                    syslogd_core::params::DEFAULT_DB_MEMORY_MAX,
                    syslogd_core::params::DEFAULT_DB_MEMORY_STR_MAX,
                );
                let ok = memory.save(record).is_ok();
                self.memory = Some(memory);
                ok
            }
            StoreKind::Memory => {
                self.memory = None;
                if self.mini.is_some() {
                    return true;
                }
                let mut mini = MiniStore::new(syslogd_core::params::DEFAULT_DB_MINI_MAX);
                let ok = mini.save(record).is_ok();
                self.mini = Some(mini);
                ok
            }
            StoreKind::Mini => false,
        }
    }

    /// Save a disaster record straight to the disaster ring, bypassing the
    /// level filter and normal routing. The copy keeps whatever id the
    /// record already has; ids are only assigned by [`StoreSet::save`].
    pub fn save_disaster(&mut self, record: &LogRecord) {
        if let Err(e) = self.disaster.save(record) {
            tracing::error!(error = %e, "disaster store save failed");
        }
    }

    /// Query the primary backend (file, then memory, then mini), falling
    /// back to the disaster ring when none is usable.
    pub fn query(
        &self,
        query: &Query,
        start_id: u64,
        count: usize,
        direction: Direction,
        reader: Reader,
    ) -> QueryResult {
        for kind in self.active_kinds() {
            match self.query_kind(kind, query, start_id, count, direction, reader) {
                Ok(result) => return result,
                Err(e) => tracing::warn!(store = %kind, error = %e, "query failed"),
            }
        }
        self.query_disaster(query, start_id, count, direction, reader)
    }

    /// Query one specific backend.
    pub fn query_kind(
        &self,
        kind: StoreKind,
        query: &Query,
        start_id: u64,
        count: usize,
        direction: Direction,
        reader: Reader,
    ) -> Result<QueryResult, StoreError> {
        self.backend(kind)
            .ok_or(StoreError::Closed(kind))?
            .query(query, start_id, count, direction, reader)
    }

    pub fn query_disaster(
        &self,
        query: &Query,
        start_id: u64,
        count: usize,
        direction: Direction,
        reader: Reader,
    ) -> QueryResult {
        self.disaster
            .query(query, start_id, count, direction, reader)
            .unwrap_or_default()
    }

    /// One statistics record per active backend plus the disaster ring and
    /// a summary.
    pub fn statistics(&self) -> Vec<LogRecord> {
        let mut out: Vec<LogRecord> = self
            .active_kinds()
            .into_iter()
            .filter_map(|k| self.backend(k).map(|s| s.statistics()))
            .collect();
        let mut disaster = self.disaster.statistics();
        disaster.set("Store", "disaster");
        out.push(disaster);

        let mut summary = LogRecord::new();
        summary.set("Store", "set");
        summary.set("Configured", self.wanted.to_string());
        summary.set("Filter", self.filter.to_string());
        summary.set("NextID", self.next_id.to_string());
        summary.set("Saved", self.saved.to_string());
        summary.set("Filtered", self.filtered.to_string());
        summary.set("Failures", self.failures.to_string());
        out.push(summary);
        out
    }

    /// Periodic maintenance across every backend.
    pub fn sweep(&mut self, now: i64) {
        for kind in self.active_kinds() {
            if let Some(store) = self.backend_mut(kind) {
                if let Err(e) = store.sweep(now) {
                    tracing::warn!(store = %kind, error = %e, "maintenance failed");
                }
            }
        }
    }

    /// Close every backend (persisting `StoreData`).
    pub fn close(&mut self) {
        for kind in self.active_kinds() {
            if let Some(store) = self.backend_mut(kind) {
                store.close();
            }
        }
    }
}
