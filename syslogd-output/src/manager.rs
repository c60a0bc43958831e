//! Shared destinations, keyed by path.
//!
//! Every rule that names the same path gets the same [`Destination`], so
//! duplicate suppression, size accounting and failure counts are per file,
//! not per rule. The manager is owned by the single consumer task; nothing
//! here is locked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use syslogd_core::{keys, DestinationOptions, LogRecord};

use crate::destination::{DestId, DestKind, Destination, DestinationStatus, WriteOutcome};
use crate::error::OutputError;
use crate::rotation::{ArchiveHook, LogArchiveHook};

/// Consecutive failures tolerated before a destination is disabled.
pub const FAILURE_LIMIT: u32 = 3;

/// Told when a destination file is opened or closed, so external deletion
/// can be reported back through [`DestinationManager::handle_deleted`].
pub trait PathMonitor: Send {
    fn watch(&mut self, path: &Path);
    fn unwatch(&mut self, path: &Path);
}

pub struct DestinationManager {
    dests: Vec<Destination>,
    by_path: HashMap<PathBuf, DestId>,
    dup_window: Duration,
    idle_window: Duration,
    hook: Box<dyn ArchiveHook>,
    monitor: Option<Box<dyn PathMonitor>>,
    diagnostics: Vec<LogRecord>,
}

impl std::fmt::Debug for DestinationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationManager")
            .field("dests", &self.dests)
            .field("dup_window", &self.dup_window)
            .field("idle_window", &self.idle_window)
            .finish()
    }
}

impl DestinationManager {
    pub fn new(dup_window: Duration, idle_window: Duration) -> Self {
        Self {
            dests: Vec::new(),
            by_path: HashMap::new(),
            dup_window,
            idle_window,
            hook: Box::new(LogArchiveHook),
            monitor: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_monitor(mut self, monitor: Box<dyn PathMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn set_timing(&mut self, dup_window: Duration, idle_window: Duration) {
        self.dup_window = dup_window;
        self.idle_window = idle_window;
    }

    /// The destination for `path`, created on first use. Later callers
    /// share the first caller's kind and options.
    pub fn resolve(
        &mut self,
        path: &Path,
        kind: DestKind,
        options: &DestinationOptions,
    ) -> Result<DestId, OutputError> {
        if let Some(id) = self.by_path.get(path) {
            return Ok(*id);
        }
        if !options.unknown.is_empty() {
            tracing::warn!(
                "{}: ignoring unknown options {}",
                path.display(),
                options.unknown.join(" ")
            );
        }
        let dest = Destination::new(path, kind, options.clone())?;
        let id = self.dests.len();
        self.dests.push(dest);
        self.by_path.insert(path.to_path_buf(), id);
        Ok(id)
    }

    pub fn find(&self, path: &Path) -> Option<DestId> {
        self.by_path.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.dests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dests.is_empty()
    }

    /// Clear every "already logged" flag. Called at the start of each
    /// module's pass over a record.
    pub fn reset_logged(&mut self) {
        for dest in &mut self.dests {
            dest.logged = false;
        }
    }

    // ---------------------------------------------------------------------------
    // Writing
    // ---------------------------------------------------------------------------

    pub fn write(&mut self, id: DestId, record: &LogRecord, now: Instant) -> WriteOutcome {
        let Some(dest) = self.dests.get_mut(id) else {
            return WriteOutcome::Disabled;
        };
        if dest.disabled {
            return WriteOutcome::Disabled;
        }
        if dest.logged {
            return WriteOutcome::AlreadyLogged;
        }
        dest.logged = true;

        let today = Utc::now().date_naive();
        if dest.options().rotate && dest.opened_day().is_some_and(|day| day != today) {
            self.checkpoint_logged(id, Utc::now());
        }

        let dest = &mut self.dests[id];
        let was_open = dest.is_open();
        let result = dest.write(record, now, self.dup_window);
        let now_open = dest.is_open();
        let path = dest.path().to_path_buf();
        let watched = dest.kind() != DestKind::Directory;
        if watched && !was_open && now_open {
            if let Some(monitor) = self.monitor.as_mut() {
                monitor.watch(&path);
            }
        }

        match result {
            Ok(outcome) => {
                if outcome == WriteOutcome::Written {
                    self.dests[id].failures = 0;
                }
                if self.dests[id].needs_checkpoint() {
                    self.checkpoint_logged(id, Utc::now());
                }
                outcome
            }
            Err(e) => self.record_failure(id, e),
        }
    }

    fn record_failure(&mut self, id: DestId, error: OutputError) -> WriteOutcome {
        let dest = &mut self.dests[id];
        dest.failures += 1;
        let was_open = dest.is_open();
        dest.forget_handle();
        let failures = dest.failures;
        let path = dest.path().to_path_buf();
        let soft = dest.options().soft;
        if was_open {
            if let Some(monitor) = self.monitor.as_mut() {
                monitor.unwatch(&path);
            }
        }
        tracing::warn!("write to {} failed ({} in a row): {}", path.display(), failures, error);

        if failures > FAILURE_LIMIT && !soft {
            self.dests[id].disabled = true;
            tracing::error!("disabling {} after {} failures", path.display(), failures);
            self.diagnostics.push(failure_record(&path, failures, &error));
            return WriteOutcome::Failed { disabled: true };
        }
        WriteOutcome::Failed { disabled: false }
    }

    /// Diagnostic records produced since the last call.
    pub fn take_diagnostics(&mut self) -> Vec<LogRecord> {
        std::mem::take(&mut self.diagnostics)
    }

    // ---------------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------------

    /// Earliest repeat flush or idle close.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.dests
            .iter()
            .flat_map(|d| {
                let idle = (!self.idle_window.is_zero() && d.is_open())
                    .then(|| d.last_used().map(|t| t + self.idle_window))
                    .flatten();
                [d.repeat_deadline(), idle]
            })
            .flatten()
            .min()
    }

    /// Flush repeat lines whose timers have fired.
    pub fn flush_due(&mut self, now: Instant) -> usize {
        let mut flushed = 0;
        for dest in &mut self.dests {
            match dest.flush_due(now) {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("cannot flush repeats to {}: {}", dest.path().display(), e),
            }
        }
        flushed
    }

    /// Close destinations unused for the idle window.
    pub fn close_idle(&mut self, now: Instant) -> usize {
        if self.idle_window.is_zero() {
            return 0;
        }
        let mut closed = 0;
        for dest in &mut self.dests {
            let idle = dest
                .last_used()
                .is_some_and(|t| now.saturating_duration_since(t) >= self.idle_window);
            if dest.is_open() && idle {
                dest.close();
                if let Some(monitor) = self.monitor.as_mut() {
                    monitor.unwatch(dest.path());
                }
                tracing::debug!("closed idle {}", dest.path().display());
                closed += 1;
            }
        }
        closed
    }

    /// Flush due repeats, then close idle destinations.
    pub fn tick(&mut self, now: Instant) {
        self.flush_due(now);
        self.close_idle(now);
    }

    // ---------------------------------------------------------------------------
    // Checkpoints
    // ---------------------------------------------------------------------------

    pub fn checkpoint(
        &mut self,
        id: DestId,
        now: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, OutputError> {
        let Some(dest) = self.dests.get_mut(id) else {
            return Ok(None);
        };
        if dest.is_open() && dest.kind() != DestKind::Directory {
            if let Some(monitor) = self.monitor.as_mut() {
                monitor.unwatch(dest.path());
            }
        }
        dest.checkpoint(now, self.hook.as_mut())
    }

    fn checkpoint_logged(&mut self, id: DestId, now: DateTime<Utc>) {
        if let Err(e) = self.checkpoint(id, now) {
            tracing::warn!("checkpoint failed: {}", e);
        }
    }

    /// Checkpoint the destination at `path`. Returns false if none exists.
    pub fn checkpoint_path(&mut self, path: &Path, now: DateTime<Utc>) -> bool {
        match self.find(path) {
            Some(id) => {
                self.checkpoint_logged(id, now);
                true
            }
            None => false,
        }
    }

    /// The daily checkpoint: every destination with rotation enabled.
    pub fn checkpoint_all(&mut self, now: DateTime<Utc>) -> usize {
        let ids: Vec<DestId> = (0..self.dests.len())
            .filter(|id| self.dests[*id].options().rotate && !self.dests[*id].disabled)
            .collect();
        for id in &ids {
            self.checkpoint_logged(*id, now);
        }
        ids.len()
    }

    /// Checkpoint destinations whose running size has reached `file_max`.
    pub fn checkpoint_full(&mut self, now: DateTime<Utc>) -> usize {
        let ids: Vec<DestId> = (0..self.dests.len())
            .filter(|id| self.dests[*id].needs_checkpoint())
            .collect();
        for id in &ids {
            self.checkpoint_logged(*id, now);
        }
        ids.len()
    }

    /// The file at `path` was removed externally: drop its handle so the
    /// next write recreates it.
    pub fn handle_deleted(&mut self, path: &Path) -> bool {
        let Some(id) = self.find(path) else {
            return false;
        };
        let dest = &mut self.dests[id];
        if !dest.is_open() {
            return false;
        }
        dest.forget_handle();
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.unwatch(path);
        }
        tracing::info!("{} was removed; it will be recreated on the next write", path.display());
        true
    }

    pub fn statuses(&self) -> Vec<DestinationStatus> {
        self.dests.iter().map(Destination::status).collect()
    }

    pub fn close_all(&mut self) {
        for dest in &mut self.dests {
            if dest.is_open() {
                dest.close();
                if let Some(monitor) = self.monitor.as_mut() {
                    monitor.unwatch(dest.path());
                }
            }
        }
    }

    /// Close and forget every destination (reconfiguration).
    pub fn clear(&mut self) {
        self.close_all();
        self.dests.clear();
        self.by_path.clear();
    }
}

fn failure_record(path: &Path, failures: u32, error: &OutputError) -> LogRecord {
    let now = Utc::now().timestamp().to_string();
    let pid = std::process::id().to_string();
    let message = format!(
        "disabled output to {} after {} consecutive failures: {}",
        path.display(),
        failures,
        error
    );
    LogRecord::from_pairs([
        (keys::TIME, now.as_str()),
        (keys::SENDER, "syslogd"),
        (keys::PID, pid.as_str()),
        (keys::UID, "0"),
        (keys::GID, "0"),
        (keys::LEVEL, "3"),
        (keys::FACILITY, "syslog"),
        (keys::MESSAGE, message.as_str()),
    ])
}

// ─── Tests ────────────────────────────────────────────────────────────────────
