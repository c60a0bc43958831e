//! syslogd daemon: verifier and quota gate, work queue, rule/action engine,
//! query/watch RPC server, interactive console, input readers, and the
//! runtime that wires them together.

pub mod console;
pub mod context;
pub mod control;
pub mod debug;
pub mod engine;
mod error;
pub mod inputs;
pub mod protocol;
pub mod queue;
pub mod quota;
mod runtime;
pub mod server;
pub mod verify;
pub mod watch;

pub use context::{DaemonContext, DaemonStatus, QueryTarget, SessionGuard, SubmitStatus};
pub use control::ControlLine;
pub use debug::DebugSink;
pub use engine::{Broadcaster, Engine, EngineStatus, Notifier};
pub use error::DaemonError;
pub use protocol::{
    control, request_query, request_status, request_stop, response_into_data, send_request,
    submit, watch_stream, DaemonRequest, DaemonResponse, QueryReply,
};
pub use queue::QueueItem;
pub use runtime::{reload, run, start_blocking, NotifyMonitor, MARK_MESSAGE};
pub use server::ClientStream;
pub use verify::{Credentials, Verdict, Verifier};
