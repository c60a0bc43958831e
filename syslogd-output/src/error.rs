//! Error types for syslogd-output.

use std::path::PathBuf;

use thiserror::Error;

use syslogd_render::RenderError;
use syslogd_store::StoreError;

/// All errors that can arise from writing to destinations.
#[derive(Debug, Error)]
pub enum OutputError {
    /// The destination's format options could not be parsed.
    #[error("format error: {0}")]
    Render(#[from] RenderError),

    /// A directory destination's store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (record files).
    #[error("record JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The destination was disabled after repeated failures.
    #[error("destination {path} is disabled")]
    Disabled { path: PathBuf },
}

/// Convenience constructor for [`OutputError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> OutputError {
    OutputError::Io {
        path: path.into(),
        source,
    }
}
