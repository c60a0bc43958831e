use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime, its servers and the client protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("configuration error: {0}")]
    Core(#[from] syslogd_core::CoreError),

    #[error("store error: {0}")]
    Store(#[from] syslogd_store::StoreError),

    #[error("output error: {0}")]
    Output(#[from] syslogd_output::OutputError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("invalid control line: {0}")]
    Control(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
