//! The query/watch RPC server.
//!
//! Each connection is a session keyed by the peer's credentials. A session's
//! watchers push into its event channel; the connection task interleaves
//! those pushes with request handling. When the peer goes away the session
//! guard drops and its watchers go with it.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};

use syslogd_core::{keys, LogRecord, Query, SourceKind};

use crate::context::{DaemonContext, QueryTarget, SessionGuard};
use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse, QueryReply};
use crate::queue::QueueItem;
use crate::verify::Credentials;
use crate::watch::{event_channel, WatchEvent};

// ---------------------------------------------------------------------------
// Socket plumbing shared with the console
// ---------------------------------------------------------------------------

/// Remove a stale socket left by a dead daemon; refuse if one is answering.
pub(crate) fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

pub(crate) fn set_socket_permissions(path: &Path, mode: u32) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err(path, e))
}

pub(crate) fn bind_listener(socket: &Path, mode: u32) -> Result<UnixListener, DaemonError> {
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    prepare_socket_for_bind(socket)?;
    let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
    set_socket_permissions(socket, mode)?;
    Ok(listener)
}

pub(crate) fn peer_credentials(stream: &UnixStream) -> Credentials {
    match stream.peer_cred() {
        Ok(cred) => Credentials::from(cred),
        Err(err) => {
            tracing::debug!(error = %err, "peer credentials unavailable");
            Credentials::UNKNOWN
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &DaemonResponse) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub async fn rpc_server_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = ctx.config.rpc_socket();
    // Anyone may connect; what they see is bounded by record ACLs.
    let listener = bind_listener(&socket, 0o666)?;
    tracing::info!(socket = %socket.display(), "rpc server listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = Arc::clone(&ctx);
                let shutdown_rx = ctx.subscribe_shutdown();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(ctx, stream, shutdown_rx).await {
                        tracing::debug!(error = %err, "rpc client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

/// Serve one connection until EOF, `stop`, or shutdown.
pub async fn handle_client<S>(
    ctx: Arc<DaemonContext>,
    stream: S,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    S: Into<ClientStream>,
{
    let ClientStream { stream, creds } = stream.into();
    let session = ctx.open_session(creds);
    let (event_tx, mut event_rx) = event_channel();
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(event) = event_rx.recv() => {
                write_response(&mut writer, &DaemonResponse::event(event.watch_id, &event.record)).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line.map_err(|e| io_err("daemon socket read", e))? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let request = match serde_json::from_str::<DaemonRequest>(&line) {
                    Ok(request) => request,
                    Err(err) => {
                        write_response(
                            &mut writer,
                            &DaemonResponse::error(format!("invalid request JSON: {err}")),
                        )
                        .await?;
                        continue;
                    }
                };

                let stop = matches!(request, DaemonRequest::Stop);
                let (response, backlog) = respond(&ctx, &session, request, &event_tx).await;
                let accepted = response.ok;
                write_response(&mut writer, &response).await?;
                for event in backlog {
                    write_response(&mut writer, &event).await?;
                }
                if stop && accepted {
                    ctx.request_shutdown();
                    break;
                }
            }
        }
    }
    Ok(())
}

/// A connection plus whoever is on the other end.
pub struct ClientStream {
    pub(crate) stream: Box<dyn ClientIo>,
    pub(crate) creds: Credentials,
}

pub trait ClientIo: tokio::io::AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ClientIo for T where T: tokio::io::AsyncRead + AsyncWrite + Send + Unpin {}

impl ClientStream {
    /// An arbitrary transport with explicit credentials, for in-process callers.
    pub fn new(stream: impl ClientIo + 'static, creds: Credentials) -> Self {
        Self {
            stream: Box::new(stream),
            creds,
        }
    }
}

impl From<UnixStream> for ClientStream {
    fn from(stream: UnixStream) -> Self {
        let creds = peer_credentials(&stream);
        Self::new(stream, creds)
    }
}

async fn respond(
    ctx: &Arc<DaemonContext>,
    session: &SessionGuard,
    request: DaemonRequest,
    event_tx: &mpsc::Sender<WatchEvent>,
) -> (DaemonResponse, Vec<DaemonResponse>) {
    let result = match request {
        DaemonRequest::Watch { query, start_id } => {
            let query = match Query::parse(&query) {
                Ok(query) => query,
                Err(err) => return (DaemonResponse::error(err.to_string()), Vec::new()),
            };
            let (watch_id, backlog) =
                ctx.watch(session.id(), query, start_id, session.reader(), event_tx.clone());
            tracing::debug!(session = session.id(), watch_id, backlog = backlog.len(), "watch registered");
            let events = backlog
                .iter()
                .map(|record| DaemonResponse::event(watch_id, record))
                .collect();
            return (
                DaemonResponse::ok(json!({ "watch_id": watch_id, "backlog": backlog.len() })),
                events,
            );
        }
        other => handle_request(ctx, session, other).await,
    };
    let response = match result {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(err.to_string()),
    };
    (response, Vec::new())
}

async fn handle_request(
    ctx: &Arc<DaemonContext>,
    session: &SessionGuard,
    request: DaemonRequest,
) -> Result<serde_json::Value, DaemonError> {
    let creds = session.creds();
    match request {
        DaemonRequest::Query {
            query,
            start_id,
            count,
            direction,
            backend,
        } => {
            let query = Query::parse(&query)?;
            let target = QueryTarget::parse(backend.as_deref())?;
            let reader = session.reader();
            let ctx = Arc::clone(ctx);
            let result = tokio::task::spawn_blocking(move || {
                ctx.query(target, &query, start_id, count, direction, reader)
            })
            .await
            .map_err(|err| DaemonError::Protocol(format!("query task join error: {err}")))??;
            Ok(serde_json::to_value(QueryReply {
                records: result.records,
                last_id: result.last_id,
            })?)
        }
        DaemonRequest::Prune { query } => {
            Query::parse(&query)?;
            Ok(json!({ "pruned": 0 }))
        }
        DaemonRequest::Submit { record } => {
            let status = ctx.submit(record, SourceKind::Rpc, Some(creds)).await;
            Ok(json!({ "status": status }))
        }
        DaemonRequest::AuxLink {
            record,
            name,
            payload,
        } => aux_link(ctx, creds, record, &name, payload).await,
        DaemonRequest::Watch { .. } => Err(DaemonError::Protocol("watch handled by the session".into())),
        DaemonRequest::Cancel { watch_id } => {
            let cancelled = ctx.cancel_watch(session.id(), watch_id);
            Ok(json!({ "cancelled": cancelled }))
        }
        DaemonRequest::Control { line } => {
            if !creds.is_root() {
                return Err(DaemonError::PermissionDenied(
                    "control lines require root".to_string(),
                ));
            }
            let (tx, rx) = oneshot::channel();
            ctx.enqueue(QueueItem::Control {
                line,
                respond_to: tx,
            })
            .await?;
            rx.await
                .map_err(|_| DaemonError::ChannelClosed("control response"))?
                .map_err(DaemonError::Control)?;
            Ok(json!({ "applied": true }))
        }
        DaemonRequest::Status => Ok(serde_json::to_value(ctx.status().await)?),
        DaemonRequest::Stop => {
            let euid = i64::from(nix::unistd::geteuid().as_raw());
            if !creds.is_root() && creds.uid != euid {
                return Err(DaemonError::PermissionDenied(
                    "only root or the daemon's user may stop it".to_string(),
                ));
            }
            tracing::info!(uid = creds.uid, pid = creds.pid, "stop requested");
            Ok(json!({ "stopping": true }))
        }
    }
}

/// Write an out-of-band payload under the aux directory and submit the
/// record pointing at it.
async fn aux_link(
    ctx: &Arc<DaemonContext>,
    creds: Credentials,
    mut record: LogRecord,
    name: &str,
    payload: String,
) -> Result<serde_json::Value, DaemonError> {
    let file_name = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.starts_with('.'))
        .ok_or_else(|| DaemonError::Protocol(format!("invalid aux file name '{name}'")))?;
    let dir = ctx.config.aux_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| io_err(&dir, e))?;
    let path: PathBuf = dir.join(format!(
        "{}.{}.{file_name}",
        Utc::now().format("%Y%m%dT%H%M%S%.6f"),
        creds.pid
    ));
    tokio::fs::write(&path, payload)
        .await
        .map_err(|e| io_err(&path, e))?;

    let url = format!("file://{}", path.display());
    record.set(keys::AUX_URL, url.clone());
    let status = ctx.submit(record, SourceKind::Rpc, Some(creds)).await;
    Ok(json!({ "url": url, "status": status }))
}
