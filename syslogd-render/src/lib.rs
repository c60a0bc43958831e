//! # syslogd-render
//!
//! Text formatting of log records for file destinations and for the query
//! tools.
//!
//! ## Usage
//!
//! ```rust
//! use syslogd_core::LogRecord;
//! use syslogd_render::Formatter;
//!
//! let record = LogRecord::from_pairs([("Sender", "foo"), ("Message", "hi")]);
//! let formatter = Formatter::from_options(Some("$Sender: $Message"), None).unwrap();
//! assert_eq!(formatter.format(&record).unwrap().text(), "foo: hi\n");
//! ```

pub mod error;
pub mod format;
pub mod time;

pub use error::RenderError;
pub use format::{encode_safe, Format, FormattedLine, Formatter, Template};
pub use time::{format_time, TimeStyle};
