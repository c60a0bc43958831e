//! The interactive query console.
//!
//! A line-oriented text protocol on its own socket. Every reply ends with
//! the `> ` prompt. Query lines run against the selected store and print one
//! formatted record per line; `watch` tails new records matching the last
//! query until `stop`.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot};

use syslogd_core::{Direction, LogRecord, Params, Query};
use syslogd_render::{Format, Formatter, TimeStyle};
use syslogd_store::StoreKind;

use crate::context::{DaemonContext, QueryTarget, SessionGuard};
use crate::error::{io_err, DaemonError};
use crate::queue::QueueItem;
use crate::server::{bind_listener, ClientStream};
use crate::watch::{event_channel, WatchEvent, WatchId};

pub const PROMPT: &str = "> ";

const HELP: &str = "\
commands:
    help                      this text
    quit                      close the console
    select [file|memory|mini] choose the store queries run against
    file|memory|mini [on|off] enable or disable a store
    dbsize [n]                show or set the selected store's size limit
    filter [level-spec]       show or set the store level filter
    stats                     store statistics
    flush                     wait until queued records are stored
    watch                     print new records matching the last query
    stop                      stop watching
    raw                       print records as [Key Value] pairs
    std                       print records as syslog lines
    * | [op key val] ...      query the selected store
";

pub async fn console_server_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = ctx.config.console_socket();
    let listener = bind_listener(&socket, 0o600)?;
    tracing::info!(socket = %socket.display(), "console listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = Arc::clone(&ctx);
                let shutdown_rx = ctx.subscribe_shutdown();
                tokio::spawn(async move {
                    if let Err(err) = handle_console(ctx, stream, shutdown_rx).await {
                        tracing::debug!(error = %err, "console client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = std::fs::remove_file(&socket);
    }
    Ok(())
}

/// What one console line asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Help,
    Quit,
    Select(Option<StoreKind>),
    Toggle { kind: StoreKind, on: Option<bool> },
    DbSize(Option<String>),
    Filter(Option<String>),
    Stats,
    Flush,
    Watch,
    Stop,
    Raw,
    Std,
    Query(Query),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let arg = (!rest.is_empty()).then(|| rest.to_string());

        let command = match word {
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            "select" => ConsoleCommand::Select(match arg.as_deref() {
                None => None,
                Some(name) => Some(StoreKind::parse(name).ok_or_else(|| format!("unknown store '{name}'"))?),
            }),
            "file" | "memory" | "mini" => {
                let kind = StoreKind::parse(word).ok_or_else(|| format!("unknown store '{word}'"))?;
                let on = match arg.as_deref() {
                    None => None,
                    Some("on") => Some(true),
                    Some("off") => Some(false),
                    Some(other) => return Err(format!("expected on or off, got '{other}'")),
                };
                ConsoleCommand::Toggle { kind, on }
            }
            "dbsize" => ConsoleCommand::DbSize(arg),
            "filter" => ConsoleCommand::Filter(arg),
            "stats" => ConsoleCommand::Stats,
            "flush" => ConsoleCommand::Flush,
            "watch" => ConsoleCommand::Watch,
            "stop" => ConsoleCommand::Stop,
            "raw" => ConsoleCommand::Raw,
            "std" => ConsoleCommand::Std,
            _ => ConsoleCommand::Query(parse_query_line(line)?),
        };
        Ok(command)
    }
}

/// `*`, bracketed clauses, or a bare `op key value` clause.
fn parse_query_line(line: &str) -> Result<Query, String> {
    let parsed = match line.chars().next() {
        Some('*' | '[') => Query::parse(line),
        Some('=' | '!' | '<' | '>' | 'T' | 'R' | 'C' | 'N' | 'S' | 'A' | 'Z') => {
            Query::parse_bare_clause(line)
        }
        _ => return Err(format!("unknown command '{line}'")),
    };
    parsed.map_err(|e| e.to_string())
}

struct Console {
    ctx: Arc<DaemonContext>,
    session: SessionGuard,
    target: QueryTarget,
    formatter: Formatter,
    last_query: Query,
    watch: Option<WatchId>,
    events: mpsc::Sender<WatchEvent>,
}

pub async fn handle_console<S>(
    ctx: Arc<DaemonContext>,
    stream: S,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    S: Into<ClientStream>,
{
    let ClientStream { stream, creds } = stream.into();
    let (events, mut event_rx) = event_channel();
    let mut console = Console {
        session: ctx.open_session(creds),
        ctx,
        target: QueryTarget::Primary,
        formatter: Formatter::default(),
        last_query: Query::all(),
        watch: None,
        events,
    };
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    write_text(&mut writer, PROMPT).await?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(event) = event_rx.recv() => {
                let text = console.render(&event.record);
                write_text(&mut writer, &text).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line.map_err(|e| io_err("console socket read", e))? else {
                    break;
                };
                if line.trim().is_empty() {
                    write_text(&mut writer, PROMPT).await?;
                    continue;
                }
                let command = match ConsoleCommand::parse(&line) {
                    Ok(command) => command,
                    Err(why) => {
                        write_text(&mut writer, &format!("{why}\n{PROMPT}")).await?;
                        continue;
                    }
                };
                if command == ConsoleCommand::Quit {
                    break;
                }
                let mut reply = console.run(command).await;
                reply.push_str(PROMPT);
                write_text(&mut writer, &reply).await?;
            }
        }
    }
    Ok(())
}

async fn write_text<W>(writer: &mut W, text: &str) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(text.as_bytes())
        .await
        .map_err(|e| io_err("console socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("console socket flush", e))
}

impl Console {
    fn render(&self, record: &LogRecord) -> String {
        match self.formatter.format(record) {
            Ok(line) => line.text(),
            Err(e) => format!("unprintable record: {e}\n"),
        }
    }

    async fn run(&mut self, command: ConsoleCommand) -> String {
        match command {
            ConsoleCommand::Help | ConsoleCommand::Quit => HELP.to_string(),
            ConsoleCommand::Select(None) => format!("{}\n", target_name(self.target)),
            ConsoleCommand::Select(Some(kind)) => {
                self.target = QueryTarget::Store(kind);
                "OK\n".to_string()
            }
            ConsoleCommand::Toggle { kind, on: None } => {
                let enabled = store_enabled(&self.ctx.params(), kind);
                format!("{kind} {}\n", if enabled { "on" } else { "off" })
            }
            ConsoleCommand::Toggle { kind, on: Some(on) } => {
                let mut kinds = self.ctx.params().db_type;
                match kind {
                    StoreKind::File => kinds.file = on,
                    StoreKind::Memory => kinds.memory = on,
                    StoreKind::Mini => kinds.mini = on,
                }
                self.set_param("db_type", &kinds.to_string())
            }
            ConsoleCommand::DbSize(None) => {
                let params = self.ctx.params();
                let kind = self.selected_kind();
                format!("{kind} {}\n", db_size(&params, kind))
            }
            ConsoleCommand::DbSize(Some(n)) => {
                let name = match self.selected_kind() {
                    StoreKind::File => "db_file_max",
                    StoreKind::Memory => "db_memory_max",
                    StoreKind::Mini => "db_mini_max",
                };
                self.set_param(name, &n)
            }
            ConsoleCommand::Filter(None) => format!("{}\n", self.ctx.params().db_filter),
            ConsoleCommand::Filter(Some(spec)) => self.set_param("db_filter", &spec),
            ConsoleCommand::Stats => {
                let mut out = String::new();
                for stats in self.ctx.statistics() {
                    out.push_str(&stats.to_string());
                    out.push('\n');
                }
                let counters = self.ctx.counters.snapshot();
                out.push_str(&format!(
                    "received {} stored {} quota_dropped {} watchers {} queue {}\n",
                    counters.received,
                    counters.stored,
                    counters.dropped_quota,
                    self.ctx.active_watchers(),
                    self.ctx.queue_depth()
                ));
                out
            }
            ConsoleCommand::Flush => {
                let (tx, rx) = oneshot::channel();
                match self.ctx.enqueue(QueueItem::Flush(tx)).await {
                    Ok(()) if rx.await.is_ok() => "OK\n".to_string(),
                    _ => "FAILED\n".to_string(),
                }
            }
            ConsoleCommand::Watch => {
                if self.watch.is_some() {
                    return "already watching\n".to_string();
                }
                let (id, _) = self.ctx.watch(
                    self.session.id(),
                    self.last_query.clone(),
                    None,
                    self.session.reader(),
                    self.events.clone(),
                );
                self.watch = Some(id);
                "OK\n".to_string()
            }
            ConsoleCommand::Stop => match self.watch.take() {
                Some(id) => {
                    self.ctx.cancel_watch(self.session.id(), id);
                    "OK\n".to_string()
                }
                None => "not watching\n".to_string(),
            },
            ConsoleCommand::Raw => {
                self.formatter = Formatter::new(Format::Raw, TimeStyle::Sec);
                "OK\n".to_string()
            }
            ConsoleCommand::Std => {
                self.formatter = Formatter::default();
                "OK\n".to_string()
            }
            ConsoleCommand::Query(query) => self.query(query).await,
        }
    }

    async fn query(&mut self, query: Query) -> String {
        self.last_query = query.clone();
        let ctx = Arc::clone(&self.ctx);
        let (target, reader) = (self.target, self.session.reader());
        let result = tokio::task::spawn_blocking(move || {
            ctx.query(target, &query, 0, 0, Direction::Forward, reader)
        })
        .await;
        match result {
            Ok(Ok(result)) => {
                let mut out: String = result.records.iter().map(|r| self.render(r)).collect();
                out.push_str(&format!(
                    "{} record{} (last id {})\n",
                    result.records.len(),
                    if result.records.len() == 1 { "" } else { "s" },
                    result.last_id
                ));
                out
            }
            Ok(Err(e)) => format!("query failed: {e}\n"),
            Err(e) => format!("query failed: {e}\n"),
        }
    }

    fn set_param(&self, name: &str, value: &str) -> String {
        if !self.session.creds().is_root() {
            return "permission denied\n".to_string();
        }
        match self.ctx.apply_param(name, value) {
            Ok(_) => "OK\n".to_string(),
            Err(e) => format!("{e}\n"),
        }
    }

    fn selected_kind(&self) -> StoreKind {
        match self.target {
            QueryTarget::Store(kind) => kind,
            QueryTarget::Disaster => StoreKind::Mini,
            QueryTarget::Primary => {
                let kinds = self.ctx.params().db_type;
                if kinds.file {
                    StoreKind::File
                } else if kinds.memory {
                    StoreKind::Memory
                } else {
                    StoreKind::Mini
                }
            }
        }
    }
}

fn target_name(target: QueryTarget) -> String {
    match target {
        QueryTarget::Primary => "primary".to_string(),
        QueryTarget::Store(kind) => kind.to_string(),
        QueryTarget::Disaster => "disaster".to_string(),
    }
}

fn store_enabled(params: &Params, kind: StoreKind) -> bool {
    match kind {
        StoreKind::File => params.db_type.file,
        StoreKind::Memory => params.db_type.memory,
        StoreKind::Mini => params.db_type.mini,
    }
}

fn db_size(params: &Params, kind: StoreKind) -> u64 {
    match kind {
        StoreKind::File => params.db_file_max,
        StoreKind::Memory => params.db_memory_max as u64,
        StoreKind::Mini => params.db_mini_max as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("help", ConsoleCommand::Help)]
    #[case("select memory", ConsoleCommand::Select(Some(StoreKind::Memory)))]
    #[case("select", ConsoleCommand::Select(None))]
    #[case("mini on", ConsoleCommand::Toggle { kind: StoreKind::Mini, on: Some(true) })]
    #[case("file off", ConsoleCommand::Toggle { kind: StoreKind::File, on: Some(false) })]
    #[case("dbsize 512", ConsoleCommand::DbSize(Some("512".into())))]
    #[case("filter 0-5", ConsoleCommand::Filter(Some("0-5".into())))]
    #[case("raw", ConsoleCommand::Raw)]
    #[case("stop", ConsoleCommand::Stop)]
    fn parses_commands(#[case] line: &str, #[case] expected: ConsoleCommand) {
        assert_eq!(ConsoleCommand::parse(line).expect("command"), expected);
    }

    #[rstest]
    #[case("*")]
    #[case("[= Sender foo] [> Level 3]")]
    #[case("= Sender foo")]
    #[case("T Facility")]
    fn parses_query_lines(#[case] line: &str) {
        assert!(matches!(ConsoleCommand::parse(line), Ok(ConsoleCommand::Query(_))));
    }

    #[rstest]
    #[case("select tape")]
    #[case("memory maybe")]
    #[case("frobnicate")]
    fn rejects_bad_lines(#[case] line: &str) {
        assert!(ConsoleCommand::parse(line).is_err());
    }
}
