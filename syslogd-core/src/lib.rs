//! syslogd core library: record model, query predicates, rule grammar,
//! runtime parameters, daemon settings.
//!
//! Public API surface:
//! - [`record`]: [`LogRecord`] and the well-known keys
//! - [`types`]: levels, facilities, source tags
//! - [`query`]: `[op key value]` predicates
//! - [`rules`]: module/rule/action grammar of the rule files
//! - [`params`]: runtime parameters settable by `= name value`
//! - [`config`]: YAML daemon settings
//! - [`error`]: [`CoreError`]

pub mod config;
pub mod error;
pub mod params;
pub mod query;
pub mod record;
pub mod rules;
pub mod types;

pub use config::DaemonConfig;
pub use error::CoreError;
pub use params::{LevelMask, Params, StoreKinds};
pub use query::{Clause, Query};
pub use record::{keys, LogRecord};
pub use rules::{Action, DestinationOptions, ModuleConfig, RotationStyle, Rule, DEFAULT_MODULE};
pub use types::{Direction, Level, SourceKind};
