//! Durable file backend.
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   StoreData               (JSON: last id, written atomically)
//!   2024.03.01.asl          (records saved that day, one JSON object per line)
//!   2024.03.01.1.asl        (earlier part of the same day, rotated at file_max)
//!   E.2024.04.01.asl        (records carrying ASLExpireTime, by expiry day)
//! ```
//!
//! Files are append-only. Maintenance removes expired files, files older than
//! the retention window, and the oldest files while the store is over its
//! size cap.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use syslogd_core::{keys, Direction, LogRecord, Query};

use crate::error::{io_err, StoreError};
use crate::{now_secs, select, LogStore, QueryResult, Reader, StoreKind};

const DATA_SUFFIX: &str = ".asl";
const STORE_DATA: &str = "StoreData";

/// Persisted store bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreData {
    pub last_id: u64,
    pub updated_at: DateTime<Utc>,
}

/// `<dir>/StoreData`
pub fn store_data_path_at(dir: &Path) -> PathBuf {
    dir.join(STORE_DATA)
}

/// Load `StoreData`, or `None` if it does not exist yet.
pub fn load_store_data_at(dir: &Path) -> Result<Option<StoreData>, StoreError> {
    let path = store_data_path_at(dir);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Save `StoreData` atomically (`.tmp` + rename).
pub fn save_store_data_at(dir: &Path, data: &StoreData) -> Result<(), StoreError> {
    let path = store_data_path_at(dir);
    let json = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

fn day_file_name(day: NaiveDate) -> String {
    format!("{}{DATA_SUFFIX}", day.format("%Y.%m.%d"))
}

fn expire_file_name(day: NaiveDate) -> String {
    format!("E.{}{DATA_SUFFIX}", day.format("%Y.%m.%d"))
}

/// Day encoded in a data file name, and whether it is an expire file.
fn parse_file_day(name: &str) -> Option<(NaiveDate, bool)> {
    let stem = name.strip_suffix(DATA_SUFFIX)?;
    let (stem, expire) = match stem.strip_prefix("E.") {
        Some(rest) => (rest, true),
        None => (stem, false),
    };
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y.%m.%d")
        .ok()
        .map(|d| (d, expire))
}

struct OpenDay {
    day: NaiveDate,
    path: PathBuf,
    file: File,
    size: u64,
}

/// Append-only daily record files.
pub struct FileStore {
    dir: PathBuf,
    file_max: u64,
    ttl_days: u32,
    current: Option<OpenDay>,
    data: StoreData,
    open: bool,
    saved: u64,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("dir", &self.dir)
            .field("file_max", &self.file_max)
            .field("ttl_days", &self.ttl_days)
            .field("open", &self.open)
            .finish()
    }
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, file_max: u64, ttl_days: u32) -> Self {
        Self {
            dir: dir.into(),
            file_max,
            ttl_days,
            current: None,
            data: StoreData {
                last_id: 0,
                updated_at: Utc::now(),
            },
            open: false,
            saved: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Highest id ever saved, from `StoreData` and the data files.
    pub fn last_id(&self) -> u64 {
        self.data.last_id
    }

    pub fn set_limits(&mut self, file_max: u64, ttl_days: u32) {
        self.file_max = file_max;
        self.ttl_days = ttl_days;
    }

    /// Every data file in the store, sorted by name.
    pub fn data_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let path = entry.path();
            let is_data = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(DATA_SUFFIX));
            if is_data && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_file(&self, path: &Path, out: &mut Vec<LogRecord>) -> Result<(), StoreError> {
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_err(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => out.push(record),
                Err(e) => tracing::warn!(path = %path.display(), line = idx + 1, error = %e, "skipping corrupt record"),
            }
        }
        Ok(())
    }

    fn scan_last_id(&self) -> Result<u64, StoreError> {
        let mut records = Vec::new();
        for path in self.data_files()? {
            self.read_file(&path, &mut records)?;
        }
        Ok(records.iter().filter_map(LogRecord::id).max().unwrap_or(0))
    }

    fn open_append(&self, path: &Path) -> Result<File, StoreError> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path).map_err(|e| io_err(path, e))
    }

    /// The open file for `day`, rolling over on a new day or at `file_max`.
    fn day_file(&mut self, day: NaiveDate) -> Result<&mut OpenDay, StoreError> {
        let roll = match &self.current {
            Some(cur) => cur.day != day || (self.file_max > 0 && cur.size >= self.file_max),
            None => true,
        };
        if roll {
            if let Some(cur) = self.current.take() {
                if cur.day == day {
                    self.rotate_full(&cur)?;
                }
            }
            let path = self.dir.join(day_file_name(day));
            let file = self.open_append(&path)?;
            let size = file.metadata().map(|m| m.len()).unwrap_or(0);
            if self.file_max > 0 && size >= self.file_max {
                self.rotate_path(&path, day)?;
                return self.day_file(day);
            }
            self.current = Some(OpenDay {
                day,
                path,
                file,
                size,
            });
        }
        self.current
            .as_mut()
            .ok_or(StoreError::Closed(StoreKind::File))
    }

    fn rotate_full(&self, cur: &OpenDay) -> Result<(), StoreError> {
        self.rotate_path(&cur.path, cur.day)
    }

    /// Move a full day file aside as `<day>.<n>.asl`.
    fn rotate_path(&self, path: &Path, day: NaiveDate) -> Result<(), StoreError> {
        let stem = day.format("%Y.%m.%d").to_string();
        let mut n = 1;
        let target = loop {
            let candidate = self.dir.join(format!("{stem}.{n}{DATA_SUFFIX}"));
            if !candidate.exists() {
                break candidate;
            }
            n += 1;
        };
        std::fs::rename(path, &target).map_err(|e| io_err(path, e))?;
        tracing::debug!(from = %path.display(), to = %target.display(), "rotated store file");
        Ok(())
    }

    fn append_line(file: &mut File, path: &Path, line: &str) -> Result<(), StoreError> {
        file.write_all(line.as_bytes()).map_err(|e| io_err(path, e))
    }

    fn total_size(files: &[PathBuf]) -> u64 {
        files
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

impl LogStore for FileStore {
    fn kind(&self) -> StoreKind {
        StoreKind::File
    }

    fn open(&mut self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let stored = load_store_data_at(&self.dir)?.map(|d| d.last_id).unwrap_or(0);
        let scanned = self.scan_last_id()?;
        self.data = StoreData {
            last_id: stored.max(scanned),
            updated_at: Utc::now(),
        };
        self.open = true;
        tracing::debug!(dir = %self.dir.display(), last_id = self.data.last_id, "file store open");
        Ok(())
    }

    fn close(&mut self) {
        self.current = None;
        if self.open {
            self.data.updated_at = Utc::now();
            if let Err(e) = save_store_data_at(&self.dir, &self.data) {
                tracing::warn!(error = %e, "failed to save StoreData");
            }
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn save(&mut self, record: &LogRecord) -> Result<u64, StoreError> {
        if !self.open {
            return Err(StoreError::Closed(StoreKind::File));
        }
        let id = record.id().unwrap_or(0);
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let expire = record.get_parsed::<i64>(keys::EXPIRE_TIME);
        match expire.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)) {
            Some(expire_at) => {
                let path = self.dir.join(expire_file_name(expire_at.date_naive()));
                let mut file = self.open_append(&path)?;
                Self::append_line(&mut file, &path, &line)?;
            }
            None => {
                let today = Utc::now().date_naive();
                let day = self.day_file(today)?;
                Self::append_line(&mut day.file, &day.path, &line)?;
                day.size += line.len() as u64;
            }
        }
        self.data.last_id = self.data.last_id.max(id);
        self.saved += 1;
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
        if !self.open {
            return Err(StoreError::Closed(StoreKind::File));
        }
        let mut records = Vec::new();
        for path in self.data_files()? {
            self.read_file(&path, &mut records)?;
        }
        records.sort_by_key(|r| r.id().unwrap_or(0));
        Ok(select(
            records.iter(),
            query,
            start_id,
            count,
            direction,
            reader,
            now_secs(),
        ))
    }

    fn statistics(&self) -> LogRecord {
        let files = self.data_files().unwrap_or_default();
        let mut stats = LogRecord::new();
        stats.set("Store", "file");
        stats.set("Directory", self.dir.display().to_string());
        stats.set("Files", files.len().to_string());
        stats.set("Bytes", Self::total_size(&files).to_string());
        stats.set("MaxBytes", self.file_max.to_string());
        stats.set("TTLDays", self.ttl_days.to_string());
        stats.set("Saved", self.saved.to_string());
        stats.set("LastID", self.data.last_id.to_string());
        stats
    }

    fn sweep(&mut self, now: i64) -> Result<(), StoreError> {
        if !self.open {
            return Ok(());
        }
        let today = DateTime::<Utc>::from_timestamp(now, 0)
            .map(|t| t.date_naive())
            .unwrap_or_else(|| Utc::now().date_naive());
        let oldest_kept = today
            .checked_sub_days(Days::new(u64::from(self.ttl_days)))
            .unwrap_or(NaiveDate::MIN);

        let mut kept = Vec::new();
        for path in self.data_files()? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let remove = match parse_file_day(name) {
                Some((day, true)) => day < today,
                Some((day, false)) => self.ttl_days > 0 && day < oldest_kept,
                None => false,
            };
            if remove {
                if self.current.as_ref().is_some_and(|c| c.path == path) {
                    self.current = None;
                }
                std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
                tracing::info!(path = %path.display(), "removed expired store file");
            } else {
                kept.push(path);
            }
        }

        if self.file_max > 0 {
            // Oldest first by modification time.
            kept.sort_by_key(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok());
            let mut total = Self::total_size(&kept);
            let mut iter = kept.iter();
            while total > self.file_max && kept.len() > 1 {
                let Some(path) = iter.next() else { break };
                if self.current.as_ref().is_some_and(|c| &c.path == path) {
                    continue;
                }
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                std::fs::remove_file(path).map_err(|e| io_err(path, e))?;
                tracing::info!(path = %path.display(), "removed store file over size cap");
                total = total.saturating_sub(size);
            }
        }

        self.data.updated_at = Utc::now();
        save_store_data_at(&self.dir, &self.data)
    }
}
