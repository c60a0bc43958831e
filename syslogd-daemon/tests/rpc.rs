//! The query/watch RPC surface: in-process sessions over a duplex pipe and a
//! full daemon round trip over its Unix socket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf};
use tokio::sync::{broadcast, mpsc};

use syslogd_core::{keys, DaemonConfig, Direction, LogRecord, Query, SourceKind, StoreKinds};
use syslogd_daemon::queue::run_consumer;
use syslogd_daemon::server::handle_client;
use syslogd_daemon::{
    reload, request_query, request_status, request_stop, submit, watch_stream, ClientStream,
    Credentials, DaemonContext, DebugSink, Engine, QueryTarget, Verifier,
};
use syslogd_store::Reader;

const USER: Credentials = Credentials {
    uid: 501,
    gid: 20,
    pid: 4242,
};

struct Daemon {
    ctx: Arc<DaemonContext>,
    shutdown: broadcast::Sender<()>,
    _dir: TempDir,
}

fn start_daemon() -> Daemon {
    let dir = TempDir::new().expect("tempdir");
    let mut config = DaemonConfig::with_root(dir.path());
    config.params.db_type = StoreKinds {
        file: false,
        memory: true,
        mini: false,
    };
    let (shutdown, _) = broadcast::channel(4);
    let (ctx, rx) =
        DaemonContext::new(config, DebugSink::new(), shutdown.clone()).expect("context");
    let mut engine = Engine::new(Arc::clone(&ctx));
    engine.configure();
    let (_deleted_tx, deleted_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_consumer(engine, rx, deleted_rx, shutdown.subscribe()));
    Daemon {
        ctx,
        shutdown,
        _dir: dir,
    }
}

struct Client {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: tokio::io::WriteHalf<DuplexStream>,
}

impl Client {
    fn connect(daemon: &Daemon, creds: Credentials) -> (Client, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let ctx = Arc::clone(&daemon.ctx);
        let shutdown = daemon.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            handle_client(ctx, ClientStream::new(server, creds), shutdown)
                .await
                .expect("session");
        });
        let (read, writer) = tokio::io::split(client);
        let client = Client {
            lines: BufReader::new(read).lines(),
            writer,
        };
        (client, handle)
    }

    async fn send(&mut self, request: Value) -> Value {
        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.next().await
    }

    async fn next(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("response in time")
            .expect("read")
            .expect("open connection");
        serde_json::from_str(&line).expect("json")
    }
}

#[tokio::test]
async fn status_reports_the_session_and_engine() {
    let daemon = start_daemon();
    let (mut client, _handle) = Client::connect(&daemon, USER);

    let reply = client.send(serde_json::json!({ "cmd": "status" })).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["sessions"], 1);
    assert!(reply["data"]["engine"]["modules"].is_array());
}

#[tokio::test]
async fn control_lines_need_root() {
    let daemon = start_daemon();
    let (mut user, _h1) = Client::connect(&daemon, USER);
    let reply = user
        .send(serde_json::json!({ "cmd": "control", "line": "= debug 1" }))
        .await;
    assert_eq!(reply["ok"], false);
    assert!(reply["error"].as_str().unwrap_or_default().contains("root"));

    let (mut root, _h2) = Client::connect(&daemon, Credentials::ROOT);
    let reply = root
        .send(serde_json::json!({ "cmd": "control", "line": "= mps_limit 9" }))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");
    assert_eq!(daemon.ctx.params().mps_limit, 9);
}

#[tokio::test]
async fn bad_json_gets_an_error_and_the_session_survives() {
    let daemon = start_daemon();
    let (mut client, _handle) = Client::connect(&daemon, USER);
    client.writer.write_all(b"{nope\n").await.expect("write");
    let reply = client.next().await;
    assert_eq!(reply["ok"], false);
    assert!(reply["error"]
        .as_str()
        .unwrap_or_default()
        .starts_with("invalid request JSON"));

    let reply = client
        .send(serde_json::json!({ "cmd": "query", "query": "[= Sender", "count": 1 }))
        .await;
    assert_eq!(reply["ok"], false);
}

#[tokio::test]
async fn a_watch_receives_submitted_records_and_dies_with_its_session() {
    let daemon = start_daemon();
    let (mut watcher, handle) = Client::connect(&daemon, USER);
    let reply = watcher
        .send(serde_json::json!({ "cmd": "watch", "query": "[= Sender probe]" }))
        .await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["backlog"], 0);
    let watch_id = reply["data"]["watch_id"].as_u64().expect("watch id");
    assert_eq!(daemon.ctx.active_watchers(), 1);

    let (mut sender, _h) = Client::connect(&daemon, USER);
    for sender_name in ["other", "probe"] {
        let record = serde_json::json!({ "Sender": sender_name, "Message": "hello" });
        let reply = sender
            .send(serde_json::json!({ "cmd": "submit", "record": record }))
            .await;
        assert_eq!(reply["data"]["status"], "accepted");
    }

    let event = watcher.next().await;
    assert_eq!(event["data"]["watch_id"], watch_id);
    assert_eq!(event["data"]["record"]["Sender"], "probe");
    assert_eq!(event["data"]["record"]["UID"], "501");

    drop(watcher);
    handle.await.expect("session task");
    assert_eq!(daemon.ctx.active_watchers(), 0);
    assert_eq!(daemon.ctx.sessions(), 1);
}

#[tokio::test]
async fn aux_link_writes_the_payload_and_points_the_record_at_it() {
    let daemon = start_daemon();
    let (mut client, _handle) = Client::connect(&daemon, USER);
    let reply = client
        .send(serde_json::json!({
            "cmd": "aux_link",
            "record": { "Sender": "crash", "Message": "report" },
            "name": "report.txt",
            "payload": "stack trace",
        }))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");
    let url = reply["data"]["url"].as_str().expect("url");
    let path = url.strip_prefix("file://").expect("file url");
    assert!(path.ends_with(".4242.report.txt"));
    assert_eq!(std::fs::read_to_string(path).expect("payload"), "stack trace");
}

// ---------------------------------------------------------------------------
// Full daemon
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reload_refreshes_the_cached_host_name() {
    let daemon = start_daemon();
    daemon.ctx.verifier.set_host("stale-host");
    reload(&daemon.ctx).await.expect("reload");
    let fresh = Verifier::new().host();
    assert_eq!(daemon.ctx.verifier.host(), fresh);

    let record = LogRecord::from_pairs([
        (keys::SENDER, "hostcheck"),
        (keys::LEVEL, "5"),
        (keys::MESSAGE, "after reload"),
    ]);
    daemon.ctx.submit(record, SourceKind::Rpc, Some(USER)).await;

    let query = Query::parse("[= Sender hostcheck]").expect("query");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let stored = loop {
        let result = daemon
            .ctx
            .query(QueryTarget::Primary, &query, 0, 0, Direction::Forward, Reader::ROOT)
            .expect("query");
        if let Some(record) = result.records.into_iter().next() {
            break record;
        }
        assert!(tokio::time::Instant::now() < deadline, "record never stored");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(stored.get(keys::HOST), Some(fresh.as_str()));
}

async fn blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.expect("blocking task")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_round_trip_over_its_socket() {
    let dir = TempDir::new().expect("tempdir");
    let config = DaemonConfig::with_root(dir.path());
    let socket = config.rpc_socket();
    let daemon = tokio::spawn(syslogd_daemon::run(config, DebugSink::new()));

    let status_socket = socket.clone();
    let status = blocking(move || {
        for _ in 0..20 {
            if let Ok(status) = request_status(&status_socket) {
                return status;
            }
        }
        panic!("daemon never came up");
    })
    .await;
    assert_eq!(status["pid"], std::process::id());

    let watch_socket = socket.clone();
    let watcher = std::thread::spawn(move || {
        let mut seen = Vec::new();
        watch_stream(&watch_socket, "[= Sender roundtrip]", None, |_, record| {
            seen.push(record);
            false
        })
        .expect("watch");
        seen
    });
    let poll_socket = socket.clone();
    blocking(move || {
        for _ in 0..100 {
            let status = request_status(&poll_socket).expect("status");
            if status["active_watchers"].as_u64() == Some(1) {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("watch never registered");
    })
    .await;

    let submit_socket = socket.clone();
    let status = blocking(move || {
        let record = LogRecord::from_pairs([
            (keys::SENDER, "roundtrip"),
            (keys::LEVEL, "3"),
            (keys::MESSAGE, "over the wire"),
        ]);
        submit(&submit_socket, record).expect("submit")
    })
    .await;
    assert_eq!(status, "accepted");

    let seen = blocking(move || watcher.join().expect("watcher thread")).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].message(), Some("over the wire"));

    let query_socket = socket.clone();
    let found = blocking(move || {
        for _ in 0..100 {
            let reply = request_query(
                &query_socket,
                "[= Sender roundtrip]",
                0,
                0,
                Direction::Forward,
                None,
            )
            .expect("query");
            if !reply.records.is_empty() {
                return reply;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("record never stored");
    })
    .await;
    assert_eq!(found.records.len(), 1);
    assert_eq!(found.last_id, found.records[0].id().expect("id"));

    let stop_socket = socket.clone();
    blocking(move || request_stop(&stop_socket).expect("stop")).await;
    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon exits")
        .expect("join")
        .expect("clean shutdown");
    assert!(!socket.exists(), "socket removed on shutdown");
}
