//! The work queue and its single consumer.
//!
//! Producers (inputs, RPC submit, timers, control) push [`QueueItem`]s onto a
//! bounded channel; one consumer task owns the [`Engine`] and handles items
//! strictly in arrival order.

use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};

use syslogd_core::LogRecord;

use crate::engine::{Engine, EngineStatus};
use crate::error::DaemonError;

pub enum QueueItem {
    /// A verified record to route.
    Record(LogRecord),
    /// A control line from an RPC caller, answered once applied.
    Control {
        line: String,
        respond_to: oneshot::Sender<Result<(), String>>,
    },
    /// Reload rules and parameters.
    Reset(oneshot::Sender<()>),
    /// Answered once everything queued before it has been handled.
    Flush(oneshot::Sender<()>),
    /// The daily checkpoint of rotating destinations.
    Checkpoint,
    Status(oneshot::Sender<EngineStatus>),
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueItem::Record(r) => f.debug_tuple("Record").field(&r.id()).finish(),
            QueueItem::Control { line, .. } => f.debug_tuple("Control").field(line).finish(),
            QueueItem::Reset(_) => f.write_str("Reset"),
            QueueItem::Flush(_) => f.write_str("Flush"),
            QueueItem::Checkpoint => f.write_str("Checkpoint"),
            QueueItem::Status(_) => f.write_str("Status"),
        }
    }
}

/// Monotonic "now" for dedup and idle timers. Follows tokio's clock so
/// paused-time tests drive it.
pub fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Drive the engine until shutdown, then drain what is left and close
/// every destination and store.
pub async fn run_consumer(
    mut engine: Engine,
    mut rx: mpsc::Receiver<QueueItem>,
    mut deleted_rx: mpsc::UnboundedReceiver<PathBuf>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let ctx = std::sync::Arc::clone(engine.context());
    loop {
        let deadline = engine.next_deadline();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            item = rx.recv() => match item {
                Some(item) => engine.handle(item),
                None => break,
            },
            Some(path) = deleted_rx.recv() => engine.path_deleted(&path),
            _ = ctx.maintenance_requested() => {}
            _ = sleep_until(deadline) => engine.tick(clock()),
        }
        if ctx.take_maintenance() {
            engine.maintain();
        }
    }

    let mut drained = 0usize;
    while let Ok(item) = rx.try_recv() {
        engine.handle(item);
        drained += 1;
    }
    engine.shutdown();
    tracing::info!(drained, "work queue stopped");
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}
