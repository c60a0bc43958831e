//! A single output target and its open-handle lifecycle.
//!
//! Three kinds share the same lifecycle:
//! - [`DestKind::Text`]: formatted lines (`file /path`), with duplicate
//!   suppression unless `coalesce=0`
//! - [`DestKind::Records`]: one JSON record per line (`store /path`)
//! - [`DestKind::Directory`]: a daily-file record store (`store_directory`)
//!
//! Handles are opened lazily. A failed open or write creates any missing
//! parent directory and retries once with a fresh handle.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use syslogd_core::{keys, DestinationOptions, LogRecord};
use syslogd_render::Formatter;
use syslogd_store::{FileStore, LogStore};

use crate::dedup::{DupDecision, DupState};
use crate::error::{io_err, OutputError};
use crate::rotation::{self, ArchiveHook};

/// Default permissions for text and record files.
pub const DEFAULT_MODE: u32 = 0o644;

/// Index of a destination inside its manager.
pub type DestId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestKind {
    Text,
    Records,
    Directory,
}

/// Result of offering one record to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Held back as a duplicate of the previous line.
    Suppressed,
    /// Another rule already wrote this record here during this module pass.
    AlreadyLogged,
    /// The destination was disabled earlier; nothing was attempted.
    Disabled,
    /// The write failed; `disabled` is set when this failure crossed the
    /// threshold and the owning rule should stop using the destination.
    Failed { disabled: bool },
}

/// Snapshot of a destination for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationStatus {
    pub path: PathBuf,
    pub kind: DestKind,
    pub open: bool,
    pub size: u64,
    pub writes: u64,
    pub failures: u32,
    pub disabled: bool,
    pub pending_repeats: u32,
}

pub struct Destination {
    path: PathBuf,
    kind: DestKind,
    options: DestinationOptions,
    formatter: Formatter,
    file: Option<File>,
    store: Option<FileStore>,
    size: u64,
    opened_day: Option<NaiveDate>,
    pub(crate) failures: u32,
    pub(crate) disabled: bool,
    pub(crate) logged: bool,
    dup: DupState,
    last_used: Option<Instant>,
    writes: u64,
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("open", &self.is_open())
            .field("size", &self.size)
            .field("failures", &self.failures)
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl Destination {
    pub fn new(
        path: impl Into<PathBuf>,
        kind: DestKind,
        options: DestinationOptions,
    ) -> Result<Self, OutputError> {
        let formatter = Formatter::from_options(
            options.format.as_deref(),
            options.time_format.as_deref(),
        )?;
        Ok(Self {
            path: path.into(),
            kind,
            options,
            formatter,
            file: None,
            store: None,
            size: 0,
            opened_day: None,
            failures: 0,
            disabled: false,
            logged: false,
            dup: DupState::default(),
            last_used: None,
            writes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> DestKind {
        self.kind
    }

    pub fn options(&self) -> &DestinationOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some() || self.store.is_some()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    /// Day the current handle was opened (UTC).
    pub fn opened_day(&self) -> Option<NaiveDate> {
        self.opened_day
    }

    pub fn status(&self) -> DestinationStatus {
        DestinationStatus {
            path: self.path.clone(),
            kind: self.kind,
            open: self.is_open(),
            size: self.size,
            writes: self.writes,
            failures: self.failures,
            disabled: self.disabled,
            pending_repeats: self.dup.pending(),
        }
    }

    fn coalesces(&self) -> bool {
        self.kind == DestKind::Text && self.options.coalesce.unwrap_or(true)
    }

    /// Whether the running size has reached `file_max`.
    pub fn needs_checkpoint(&self) -> bool {
        self.kind != DestKind::Directory
            && self.options.rotate
            && self.options.file_max.is_some_and(|max| max > 0 && self.size >= max)
    }

    // ---------------------------------------------------------------------------
    // Open / close
    // ---------------------------------------------------------------------------

    pub fn open(&mut self) -> Result<(), OutputError> {
        if self.is_open() {
            return Ok(());
        }
        match self.kind {
            DestKind::Directory => {
                let mut store = FileStore::new(
                    &self.path,
                    self.options.file_max.unwrap_or(0),
                    self.options.ttl_days.unwrap_or(0),
                );
                store.open()?;
                self.store = Some(store);
                self.size = 0;
            }
            DestKind::Text | DestKind::Records => {
                let file = match self.open_file() {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        if let Some(parent) = self.path.parent() {
                            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                        }
                        self.open_file()
                    }
                    other => other,
                }
                .map_err(|e| io_err(&self.path, e))?;
                self.size = file.metadata().map(|m| m.len()).unwrap_or(0);
                self.apply_owner();
                self.file = Some(file);
            }
        }
        self.opened_day = Some(Utc::now().date_naive());
        tracing::debug!("opened {} (size {})", self.path.display(), self.size);
        Ok(())
    }

    fn open_file(&self) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(self.options.mode.unwrap_or(DEFAULT_MODE));
        }
        options.open(&self.path)
    }

    #[cfg(unix)]
    fn apply_owner(&self) {
        if self.options.uid.is_none() && self.options.gid.is_none() {
            return;
        }
        if let Err(e) = std::os::unix::fs::chown(&self.path, self.options.uid, self.options.gid) {
            tracing::warn!("cannot set owner of {}: {}", self.path.display(), e);
        }
    }

    #[cfg(not(unix))]
    fn apply_owner(&self) {}

    /// Flush pending repeats and drop the handle.
    pub fn close(&mut self) {
        if let Some(count) = self.dup.take_pending() {
            let line = self.formatter.repeat_notice(count, Utc::now().timestamp());
            if let Err(e) = self.append(&line) {
                tracing::warn!("cannot flush repeats to {}: {}", self.path.display(), e);
            }
        }
        if let Some(mut store) = self.store.take() {
            store.close();
        }
        self.file = None;
        self.opened_day = None;
    }

    /// Drop the handle without touching the file, which no longer exists.
    pub(crate) fn forget_handle(&mut self) {
        self.dup.take_pending();
        self.file = None;
        self.size = 0;
        self.opened_day = None;
    }

    // ---------------------------------------------------------------------------
    // Writing
    // ---------------------------------------------------------------------------

    fn append(&mut self, text: &str) -> Result<(), OutputError> {
        let file = self.file.as_mut().ok_or_else(|| OutputError::Disabled {
            path: self.path.clone(),
        })?;
        file.write_all(text.as_bytes())
            .map_err(|e| io_err(&self.path, e))?;
        self.size += text.len() as u64;
        Ok(())
    }

    /// Open if needed and append, retrying once with a fresh handle.
    fn append_with_retry(&mut self, text: &str) -> Result<(), OutputError> {
        let first = self.open().and_then(|_| self.append(text));
        match first {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!("retrying {} after: {}", self.path.display(), e);
                self.file = None;
                self.open()?;
                self.append(text)
            }
        }
    }

    /// Write one record. `window` is the duplicate-suppression window.
    pub fn write(
        &mut self,
        record: &LogRecord,
        now: Instant,
        window: Duration,
    ) -> Result<WriteOutcome, OutputError> {
        self.last_used = Some(now);
        match self.kind {
            DestKind::Text => {
                let line = self.formatter.format(record)?;
                if self.coalesces() {
                    match self.dup.check(&line.body, now, window) {
                        DupDecision::Suppress { .. } => return Ok(WriteOutcome::Suppressed),
                        DupDecision::Write { flush: Some(count) } => {
                            let notice = self.formatter.repeat_notice(count, Utc::now().timestamp());
                            self.append_with_retry(&notice)?;
                            self.dup.take_pending();
                        }
                        DupDecision::Write { flush: None } => {}
                    }
                }
                self.append_with_retry(&line.text())?;
                if self.coalesces() {
                    self.dup.written(&line.body, now);
                }
            }
            DestKind::Records => {
                let mut json = serde_json::to_string(record)?;
                json.push('\n');
                self.append_with_retry(&json)?;
            }
            DestKind::Directory => {
                self.open()?;
                let store = self.store.as_mut().ok_or_else(|| OutputError::Disabled {
                    path: self.path.clone(),
                })?;
                if record.id().is_some() {
                    store.save(record)?;
                } else {
                    let mut numbered = record.clone();
                    numbered.set(keys::MESSAGE_ID, (store.last_id() + 1).to_string());
                    store.save(&numbered)?;
                }
            }
        }
        self.writes += 1;
        Ok(WriteOutcome::Written)
    }

    /// Emit the repeat line if its timer has fired by `now`.
    pub fn flush_due(&mut self, now: Instant) -> Result<bool, OutputError> {
        match self.dup.take_due(now) {
            Some(count) => {
                let notice = self.formatter.repeat_notice(count, Utc::now().timestamp());
                self.append_with_retry(&notice)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn repeat_deadline(&self) -> Option<Instant> {
        self.dup.deadline()
    }

    // ---------------------------------------------------------------------------
    // Checkpoint
    // ---------------------------------------------------------------------------

    /// Close, archive and prune. The next write reopens a fresh file.
    pub fn checkpoint(
        &mut self,
        now: DateTime<Utc>,
        hook: &mut dyn ArchiveHook,
    ) -> Result<Option<PathBuf>, OutputError> {
        if self.kind == DestKind::Directory {
            self.open()?;
            if let Some(store) = self.store.as_mut() {
                store.sweep(now.timestamp())?;
            }
            return Ok(None);
        }

        self.close();
        self.size = 0;
        let archive = rotation::rotate(&self.path, self.options.style, now)
            .map_err(|e| io_err(&self.path, e))?;
        if let Some(archive) = &archive {
            hook.archived(&self.path, archive, &self.options);
        }
        let removed = rotation::prune_archives(
            &self.path,
            self.options.all_max,
            self.options.ttl_days,
            now.into(),
        )
        .map_err(|e| io_err(&self.path, e))?;
        for path in removed {
            tracing::debug!("removed archive {}", path.display());
        }
        Ok(archive)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::LogArchiveHook;
    use tempfile::TempDir;

    fn record(msg: &str) -> LogRecord {
        LogRecord::from_pairs([
            (keys::TIME, "1709294400"),
            (keys::HOST, "box"),
            (keys::SENDER, "foo"),
            (keys::PID, "42"),
            (keys::LEVEL, "5"),
            (keys::MESSAGE, msg),
        ])
    }

    fn text(dir: &TempDir, name: &str, options: &str) -> Destination {
        Destination::new(
            dir.path().join(name),
            DestKind::Text,
            DestinationOptions::parse(options),
        )
        .unwrap()
    }

    #[test]
    fn open_creates_missing_parents() {
        let dir = TempDir::new().unwrap();
        let mut dest = text(&dir, "a/b/out.log", "");
        dest.write(&record("hi"), Instant::now(), Duration::ZERO).unwrap();
        let body = std::fs::read_to_string(dir.path().join("a/b/out.log")).unwrap();
        assert!(body.ends_with("box foo[42] <Notice>: hi\n"), "{body}");
        assert_eq!(dest.size(), body.len() as u64);
    }

    #[cfg(unix)]
    #[test]
    fn mode_option_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let mut dest = text(&dir, "out.log", "mode=0600");
        dest.write(&record("hi"), Instant::now(), Duration::ZERO).unwrap();
        let mode = std::fs::metadata(dest.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn coalesce_off_writes_every_duplicate() {
        let dir = TempDir::new().unwrap();
        let mut dest = text(&dir, "out.log", "coalesce=0");
        let now = Instant::now();
        let window = Duration::from_secs(30);
        assert_eq!(dest.write(&record("x"), now, window).unwrap(), WriteOutcome::Written);
        assert_eq!(dest.write(&record("x"), now, window).unwrap(), WriteOutcome::Written);
        let body = std::fs::read_to_string(dest.path()).unwrap();
        assert_eq!(body.lines().count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn failed_write_does_not_arm_duplicate_suppression() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blocker"), b"").unwrap();
        let mut dest = text(&dir, "blocker/out.log", "");
        let now = Instant::now();
        let window = Duration::from_secs(30);
        for _ in 0..3 {
            assert!(dest.write(&record("x"), now, window).is_err());
        }
        let status = dest.status();
        assert_eq!(status.writes, 0);
        assert_eq!(status.pending_repeats, 0);
        assert_eq!(dest.repeat_deadline(), None);
    }

    #[test]
    fn duplicate_after_a_successful_write_is_suppressed() {
        let dir = TempDir::new().unwrap();
        let mut dest = text(&dir, "out.log", "");
        let now = Instant::now();
        let window = Duration::from_secs(30);
        assert_eq!(dest.write(&record("x"), now, window).unwrap(), WriteOutcome::Written);
        assert_eq!(dest.write(&record("x"), now, window).unwrap(), WriteOutcome::Suppressed);
        assert_eq!(dest.status().pending_repeats, 1);
    }

    #[test]
    fn record_files_hold_json_lines() {
        let dir = TempDir::new().unwrap();
        let mut dest = Destination::new(
            dir.path().join("records.asl"),
            DestKind::Records,
            DestinationOptions::default(),
        )
        .unwrap();
        dest.write(&record("one"), Instant::now(), Duration::ZERO).unwrap();
        let body = std::fs::read_to_string(dest.path()).unwrap();
        let back: LogRecord = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(back.message(), Some("one"));
    }

    #[test]
    fn directory_destination_numbers_records() {
        let dir = TempDir::new().unwrap();
        let mut dest = Destination::new(
            dir.path().join("store"),
            DestKind::Directory,
            DestinationOptions::default(),
        )
        .unwrap();
        dest.write(&record("one"), Instant::now(), Duration::ZERO).unwrap();
        dest.write(&record("two"), Instant::now(), Duration::ZERO).unwrap();
        dest.close();

        let mut store = FileStore::new(dir.path().join("store"), 0, 0);
        store.open().unwrap();
        assert_eq!(store.last_id(), 2);
    }

    #[test]
    fn checkpoint_archives_and_resets_size() {
        let dir = TempDir::new().unwrap();
        let mut dest = text(&dir, "out.log", "file_max=10");
        dest.write(&record("long enough"), Instant::now(), Duration::ZERO).unwrap();
        assert!(dest.needs_checkpoint());

        let archive = dest.checkpoint(Utc::now(), &mut LogArchiveHook).unwrap().unwrap();
        assert_eq!(archive, dir.path().join("out.log.1"));
        assert_eq!(dest.size(), 0);
        assert!(!dest.is_open());

        dest.write(&record("b"), Instant::now(), Duration::ZERO).unwrap();
        assert!(dest.path().exists());
    }
}
