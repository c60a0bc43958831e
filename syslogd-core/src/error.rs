//! Error types for syslogd-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from parsing records, queries, rules,
/// parameters and daemon settings.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure while reading a settings or rule file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse settings at {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A `[op key value]` clause could not be parsed.
    #[error("invalid query: {0}")]
    Query(String),

    /// A regex clause carried an invalid pattern.
    #[error("invalid regex '{pattern}': {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A rule-file line could not be parsed.
    #[error("invalid rule on line {line}: {reason}")]
    Rule { line: usize, reason: String },

    /// `= name value` named a parameter that does not exist.
    #[error("unknown parameter '{0}'")]
    UnknownParam(String),

    /// `= name value` carried a value the parameter cannot take.
    #[error("invalid value '{value}' for parameter '{name}'")]
    InvalidParam { name: String, value: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}
