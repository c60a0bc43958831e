use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use notify::event::ModifyKind;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use syslogd_core::{keys, DaemonConfig, LogRecord, SourceKind};
use syslogd_output::PathMonitor;

use crate::console::console_server_task;
use crate::context::DaemonContext;
use crate::debug::{DebugSink, DEBUG_DIRECTIVES};
use crate::engine::Engine;
use crate::error::{io_err, DaemonError};
use crate::inputs::{kernel_task, local_socket_task, udp_task};
use crate::queue::{run_consumer, QueueItem};
use crate::server::rpc_server_task;
use crate::verify::Credentials;

pub const MARK_MESSAGE: &str = "-- MARK --";

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(config: DaemonConfig) -> Result<(), DaemonError> {
    let debug = DebugSink::new();
    init_tracing(&debug);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config, debug))
}

/// Run the daemon until a signal or a `stop` request.
pub async fn run(config: DaemonConfig, debug: DebugSink) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&config)?;

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (ctx, queue_rx) = DaemonContext::new(config, debug, shutdown_tx.clone())?;
    let (deleted_tx, deleted_rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut engine = Engine::new(Arc::clone(&ctx));
    match NotifyMonitor::new(deleted_tx) {
        Ok(monitor) => engine = engine.with_monitor(Box::new(monitor)),
        Err(err) => tracing::warn!(error = %err, "file deletion monitoring unavailable"),
    }
    engine.configure();
    tracing::info!(root = %ctx.config.root.display(), "syslogd starting");

    let consumer_handle = spawn_task(&shutdown_tx, {
        let shutdown_rx = shutdown_tx.subscribe();
        run_consumer(engine, queue_rx, deleted_rx, shutdown_rx)
    });
    let rpc_handle = spawn_task(
        &shutdown_tx,
        rpc_server_task(Arc::clone(&ctx), shutdown_tx.subscribe()),
    );
    let console_handle = spawn_task(
        &shutdown_tx,
        console_server_task(Arc::clone(&ctx), shutdown_tx.subscribe()),
    );
    let local_handle = spawn_task(
        &shutdown_tx,
        local_socket_task(Arc::clone(&ctx), shutdown_tx.subscribe()),
    );
    let udp_handle = spawn_task(
        &shutdown_tx,
        udp_task(Arc::clone(&ctx), shutdown_tx.subscribe()),
    );
    let kernel_handle = spawn_task(
        &shutdown_tx,
        kernel_task(Arc::clone(&ctx), shutdown_tx.subscribe()),
    );
    let timer_handle = spawn_task(
        &shutdown_tx,
        timer_task(Arc::clone(&ctx), shutdown_tx.subscribe()),
    );
    let signal_handle = spawn_task(
        &shutdown_tx,
        signal_task(Arc::clone(&ctx), shutdown_tx.subscribe()),
    );

    let (consumer, rpc, console, local, udp, kernel, timers, signals) = tokio::join!(
        consumer_handle,
        rpc_handle,
        console_handle,
        local_handle,
        udp_handle,
        kernel_handle,
        timer_handle,
        signal_handle
    );

    handle_join("work_queue", consumer)?;
    handle_join("rpc_server", rpc)?;
    handle_join("console", console)?;
    handle_join("local_socket", local)?;
    handle_join("udp", udp)?;
    handle_join("kernel", kernel)?;
    handle_join("timers", timers)?;
    handle_join("signal_handler", signals)?;
    tracing::info!("syslogd stopped");
    Ok(())
}

/// Spawn a daemon task; whichever way it ends, every other task is told to
/// stop.
fn spawn_task<F>(shutdown: &broadcast::Sender<()>, task: F) -> JoinHandle<Result<(), DaemonError>>
where
    F: Future<Output = Result<(), DaemonError>> + Send + 'static,
{
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = task.await;
        if let Err(err) = &result {
            tracing::error!(error = %err, "daemon task failed");
        }
        let _ = shutdown.send(());
        result
    })
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

fn every(secs: u64) -> Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Time left until the next local midnight.
fn until_midnight() -> Duration {
    let now = Local::now();
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|t| t.and_local_timezone(Local).earliest());
    match next {
        Some(next) => (next - now).to_std().unwrap_or(Duration::from_secs(60)),
        None => Duration::from_secs(86_400),
    }
}

/// Mark records, store maintenance, and the daily checkpoint. Intervals are
/// rebuilt whenever a timer parameter changes.
async fn timer_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        let params = ctx.params();
        let mut mark = (params.mark_time > 0).then(|| every(params.mark_time));
        let mut maintenance = every(params.maintenance_interval);
        let mut midnight = Box::pin(tokio::time::sleep(until_midnight()));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                _ = ctx.timers_changed() => break,
                _ = tick(&mut mark) => {
                    let record = LogRecord::from_pairs([
                        (keys::MESSAGE, MARK_MESSAGE),
                        (keys::LEVEL, "6"),
                        (keys::FACILITY, "syslog"),
                    ]);
                    ctx.submit(record, SourceKind::Internal, Some(Credentials::ROOT)).await;
                }
                _ = maintenance.tick() => ctx.request_maintenance(),
                _ = &mut midnight => {
                    tracing::debug!(at = %Utc::now(), "daily checkpoint due");
                    ctx.enqueue(QueueItem::Checkpoint).await?;
                    midnight = Box::pin(tokio::time::sleep(until_midnight()));
                }
            }
        }
        tracing::debug!("timer parameters changed");
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

async fn signal_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut term = signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    let mut hup = signal(SignalKind::hangup()).map_err(|e| io_err("SIGHUP handler", e))?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|err| DaemonError::Protocol(format!("ctrl-c handler failed: {err}")))?;
                tracing::info!("received ctrl-c, shutting down daemon");
                ctx.request_shutdown();
                return Ok(());
            }
            _ = term.recv() => {
                tracing::info!("received SIGTERM, shutting down daemon");
                ctx.request_shutdown();
                return Ok(());
            }
            _ = hup.recv() => {
                tracing::info!("received SIGHUP, reloading configuration");
                reload(&ctx).await?;
            }
        }
    }
}

/// Reset parameters and rebuild every module, holding the reset lock until
/// the consumer has finished. The cached host name is looked up again.
pub async fn reload(ctx: &DaemonContext) -> Result<(), DaemonError> {
    let _guard = ctx.reset_lock.lock().await;
    ctx.verifier.invalidate_host();
    let (tx, rx) = oneshot::channel();
    ctx.enqueue(QueueItem::Reset(tx)).await?;
    rx.await
        .map_err(|_| DaemonError::ChannelClosed("reset acknowledgement"))
}

// ---------------------------------------------------------------------------
// Deleted-file monitor
// ---------------------------------------------------------------------------

/// Watches open destination files and reports removals and renames to the
/// work queue consumer.
pub struct NotifyMonitor {
    watcher: RecommendedWatcher,
}

impl NotifyMonitor {
    pub fn new(deleted_tx: mpsc::UnboundedSender<PathBuf>) -> Result<Self, DaemonError> {
        let watcher = recommended_watcher(move |event: notify::Result<Event>| {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "watcher event error");
                    return;
                }
            };
            if !is_gone(&event.kind) {
                return;
            }
            for path in event.paths {
                let _ = deleted_tx.send(path);
            }
        })?;
        Ok(Self { watcher })
    }
}

fn is_gone(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)))
}

impl PathMonitor for NotifyMonitor {
    fn watch(&mut self, path: &Path) {
        if let Err(err) = self.watcher.watch(path, RecursiveMode::NonRecursive) {
            tracing::debug!(path = %path.display(), error = %err, "cannot watch destination");
        }
    }

    fn unwatch(&mut self, path: &Path) {
        let _ = self.watcher.unwatch(path);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_runtime_dirs(config: &DaemonConfig) -> Result<(), DaemonError> {
    let mut dirs = vec![config.store_dir(), config.aux_dir()];
    for socket in [config.rpc_socket(), config.console_socket(), config.bsd_socket()] {
        if let Some(parent) = socket.parent() {
            dirs.push(parent.to_path_buf());
        }
    }
    for dir in dirs {
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing(debug: &DebugSink) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter, Layer};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false).with_filter(filter);
    let debug_file = fmt::layer()
        .with_ansi(false)
        .with_writer(debug.clone())
        .with_filter(EnvFilter::new(DEBUG_DIRECTIVES));
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(debug_file)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind, RenameMode};

    #[test]
    fn removals_and_renames_count_as_gone() {
        assert!(is_gone(&EventKind::Remove(RemoveKind::File)));
        assert!(is_gone(&EventKind::Modify(ModifyKind::Name(RenameMode::From))));
        assert!(!is_gone(&EventKind::Create(CreateKind::File)));
    }

    #[test]
    fn midnight_is_less_than_a_day_away() {
        let left = until_midnight();
        assert!(left > Duration::ZERO);
        assert!(left <= Duration::from_secs(25 * 3600));
    }

    #[tokio::test(start_paused = true)]
    async fn intervals_wait_a_full_period_before_the_first_tick() {
        let mut mark = Some(every(5));
        let started = Instant::now();
        tick(&mut mark).await;
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }
}
