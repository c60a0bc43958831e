//! RPC wire format and the blocking client used by the CLI.
//!
//! One JSON object per line in each direction. A request names its command
//! in `cmd`; every reply is a [`DaemonResponse`]. After a `watch` request the
//! connection also carries one event line per matching record.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use syslogd_core::{Direction, LogRecord};

use crate::error::{io_err, DaemonError};

fn match_all() -> String {
    "*".to_string()
}

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Query {
        #[serde(default = "match_all")]
        query: String,
        #[serde(default)]
        start_id: u64,
        /// 0 means no limit.
        #[serde(default)]
        count: usize,
        #[serde(default)]
        direction: Direction,
        /// `file`, `memory`, `mini` or `disaster`; the primary store if absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend: Option<String>,
    },
    /// Accepted for compatibility; removes nothing.
    Prune {
        #[serde(default = "match_all")]
        query: String,
    },
    Submit {
        record: LogRecord,
    },
    AuxLink {
        record: LogRecord,
        name: String,
        payload: String,
    },
    Watch {
        #[serde(default = "match_all")]
        query: String,
        /// Replay stored matches from this id first; live records only if absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_id: Option<u64>,
    },
    Cancel {
        watch_id: u64,
    },
    Control {
        line: String,
    },
    Status,
    Stop,
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// A pushed watch record.
    pub fn event(watch_id: u64, record: &LogRecord) -> Self {
        Self::ok(json!({ "watch_id": watch_id, "record": record }))
    }
}

/// Reply body of a `query` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryReply {
    pub records: Vec<LogRecord>,
    pub last_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatchEventBody {
    watch_id: u64,
    record: LogRecord,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

fn connect(socket: &Path) -> Result<UnixStream, DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning {
            socket: socket.to_path_buf(),
        });
    }
    UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })
}

fn write_request(
    stream: &mut UnixStream,
    socket: &Path,
    request: &DaemonRequest,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))
}

fn read_response(
    reader: &mut BufReader<UnixStream>,
    socket: &Path,
) -> Result<Option<DaemonResponse>, DaemonError> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(socket, e))?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(socket: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let mut stream = connect(socket)?;
    write_request(&mut stream, socket, request)?;
    let mut reader = BufReader::new(stream);
    read_response(&mut reader, socket)?.ok_or_else(|| {
        DaemonError::Protocol("daemon closed connection before responding".to_string())
    })
}

pub fn request_status(socket: &Path) -> Result<Value, DaemonError> {
    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(socket, &DaemonRequest::Status) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(socket: &Path) -> Result<(), DaemonError> {
    let response = send_request(socket, &DaemonRequest::Stop)?;
    response_into_data(response).map(|_| ())
}

pub fn request_query(
    socket: &Path,
    query: &str,
    start_id: u64,
    count: usize,
    direction: Direction,
    backend: Option<String>,
) -> Result<QueryReply, DaemonError> {
    let response = send_request(
        socket,
        &DaemonRequest::Query {
            query: query.to_string(),
            start_id,
            count,
            direction,
            backend,
        },
    )?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

/// Submit a record; returns how the daemon took it (`accepted`, `notice`,
/// `dropped`).
pub fn submit(socket: &Path, record: LogRecord) -> Result<String, DaemonError> {
    let data = response_into_data(send_request(socket, &DaemonRequest::Submit { record })?)?;
    Ok(data
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("accepted")
        .to_string())
}

pub fn control(socket: &Path, line: &str) -> Result<(), DaemonError> {
    let response = send_request(
        socket,
        &DaemonRequest::Control {
            line: line.to_string(),
        },
    )?;
    response_into_data(response).map(|_| ())
}

/// Register a watch and feed each pushed record to `on_record` until it
/// returns false or the daemon hangs up. Returns the watch id.
pub fn watch_stream<F>(
    socket: &Path,
    query: &str,
    start_id: Option<u64>,
    mut on_record: F,
) -> Result<u64, DaemonError>
where
    F: FnMut(u64, LogRecord) -> bool,
{
    let mut stream = connect(socket)?;
    write_request(
        &mut stream,
        socket,
        &DaemonRequest::Watch {
            query: query.to_string(),
            start_id,
        },
    )?;
    let mut reader = BufReader::new(stream);
    let reply = read_response(&mut reader, socket)?.ok_or_else(|| {
        DaemonError::Protocol("daemon closed connection before responding".to_string())
    })?;
    let watch_id = response_into_data(reply)?
        .get("watch_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| DaemonError::Protocol("watch reply without watch_id".to_string()))?;

    while let Some(response) = read_response(&mut reader, socket)? {
        let event: WatchEventBody = serde_json::from_value(response_into_data(response)?)?;
        if !on_record(event.watch_id, event.record) {
            break;
        }
    }
    Ok(watch_id)
}

pub fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syslogd_core::keys;

    #[test]
    fn requests_use_cmd_tags_and_defaults() {
        let request: DaemonRequest = serde_json::from_str(r#"{"cmd":"query"}"#).expect("query");
        assert_eq!(
            request,
            DaemonRequest::Query {
                query: "*".into(),
                start_id: 0,
                count: 0,
                direction: Direction::Forward,
                backend: None,
            }
        );

        let text = serde_json::to_string(&DaemonRequest::Watch {
            query: "[= Sender foo]".into(),
            start_id: None,
        })
        .expect("encode");
        assert_eq!(text, r#"{"cmd":"watch","query":"[= Sender foo]"}"#);

        let aux: DaemonRequest = serde_json::from_str(
            r#"{"cmd":"aux_link","record":{"Sender":"x"},"name":"a.txt","payload":"p"}"#,
        )
        .expect("aux");
        assert!(matches!(aux, DaemonRequest::AuxLink { ref name, .. } if name == "a.txt"));
    }

    #[test]
    fn missing_socket_means_not_running() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let err = send_request(&dir.path().join("nope.sock"), &DaemonRequest::Status)
            .expect_err("no daemon");
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }

    #[test]
    fn error_responses_become_protocol_errors() {
        let err = response_into_data(DaemonResponse::error("bad")).expect_err("error");
        assert_eq!(err.to_string(), "daemon protocol error: bad");

        let record = LogRecord::from_pairs([(keys::MESSAGE, "hi")]);
        let event = DaemonResponse::event(4, &record);
        let body: WatchEventBody =
            serde_json::from_value(response_into_data(event).expect("data")).expect("body");
        assert_eq!(body.watch_id, 4);
        assert_eq!(body.record.message(), Some("hi"));
    }
}
