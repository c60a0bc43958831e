//! The `debug` parameter's log file.
//!
//! [`DebugSink`] is a `MakeWriter` for a second fmt layer. While debug is
//! off it swallows everything; turning it on opens the file in append mode.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use syslogd_core::Params;

use crate::error::{io_err, DaemonError};

/// Targets written to the debug file at DEBUG level.
pub const DEBUG_DIRECTIVES: &str = "syslogd_daemon=debug,syslogd_store=debug,syslogd_output=debug";

#[derive(Debug, Clone, Default)]
pub struct DebugSink {
    inner: Arc<Mutex<Option<(PathBuf, File)>>>,
}

impl DebugSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open or close the debug file to match `params`.
    pub fn apply(&self, params: &Params, default_path: &Path) -> Result<(), DaemonError> {
        if !params.debug {
            let closed = self.inner.lock().take();
            if let Some((path, _)) = closed {
                tracing::info!(path = %path.display(), "debug log closed");
            }
            return Ok(());
        }
        let path = params
            .debug_file
            .clone()
            .unwrap_or_else(|| default_path.to_path_buf());
        let mut inner = self.inner.lock();
        if inner.as_ref().is_some_and(|(open, _)| *open == path) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        *inner = Some((path, file));
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().as_ref().map(|(path, _)| path.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().is_some()
    }
}

pub struct DebugWriter {
    inner: Arc<Mutex<Option<(PathBuf, File)>>>,
}

impl Write for DebugWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.lock().as_mut() {
            Some((_, file)) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock().as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DebugSink {
    type Writer = DebugWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DebugWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}
