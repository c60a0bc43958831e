//! Error types for syslogd-store.

use std::path::PathBuf;

use thiserror::Error;

use crate::StoreKind;

/// All errors that can arise from storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (records, `StoreData`).
    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend was used while closed.
    #[error("{0} store is not open")]
    Closed(StoreKind),

    /// No backend at all could be opened.
    #[error("no storage backend could be opened")]
    Unavailable,
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
