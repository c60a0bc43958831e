//! # syslogd-output
//!
//! Output destinations for routed records.
//!
//! [`DestinationManager`] owns every [`Destination`] by path. It opens files
//! lazily, suppresses duplicate lines, checkpoints (rotates) files by size
//! or on the daily timer, closes idle handles, and disables a destination
//! that keeps failing, leaving one diagnostic record behind.

pub mod dedup;
pub mod destination;
pub mod error;
pub mod manager;
pub mod rotation;

pub use destination::{DestId, DestKind, Destination, DestinationStatus, WriteOutcome};
pub use error::OutputError;
pub use manager::{DestinationManager, PathMonitor, FAILURE_LIMIT};
pub use rotation::{ArchiveHook, LogArchiveHook};
