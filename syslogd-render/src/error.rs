//! Error types for syslogd-render.

use thiserror::Error;

/// All errors that can arise from formatting records.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A custom `$(Key)` template could not be parsed.
    #[error("invalid format template '{template}': {reason}")]
    Template { template: String, reason: String },

    /// `time_format=` or a `$((Time)(style))` modifier named no known style.
    #[error("unknown time style '{0}'")]
    UnknownTimeStyle(String),

    /// JSON serialization error (the `json` format).
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
