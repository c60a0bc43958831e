//! Input readers: the legacy datagram socket, UDP, and the kernel device.
//!
//! Each reader is its own task and only ever suspends on its own I/O or on
//! the work queue. A reader that cannot start logs why and idles until
//! shutdown; the rest of the daemon keeps running.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::broadcast;

use syslogd_core::types::facility_name;
use syslogd_core::{keys, LogRecord, SourceKind};

use crate::context::{Counters, DaemonContext};
use crate::error::{io_err, DaemonError};
use crate::server::{prepare_socket_for_bind, set_socket_permissions};

const MAX_DATAGRAM: usize = 65_536;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse `<pri>Mmm dd hh:mm:ss host sender[pid]: msg`. Every part but the
/// message is optional; the host field is only read from network sources.
pub fn parse_legacy(line: &str, source: SourceKind, now: DateTime<Local>) -> Option<LogRecord> {
    let mut rest = line.trim_end_matches(['\n', '\r', '\0']);
    if rest.trim().is_empty() {
        return None;
    }
    let mut record = LogRecord::new();

    if let Some((pri, after)) = rest.strip_prefix('<').and_then(|s| s.split_once('>')) {
        if let Ok(pri) = pri.parse::<u32>() {
            record.set(keys::LEVEL, (pri & 7).to_string());
            record.set(keys::FACILITY, facility_name(pri >> 3));
            rest = after;
        }
    }

    let mut stamped = false;
    if let Some(time) = rest.get(..15).and_then(|t| parse_bsd_time(t, now)) {
        if rest.as_bytes().get(15) == Some(&b' ') {
            record.set(keys::TIME, time.to_string());
            rest = &rest[16..];
            stamped = true;
        }
    }

    if stamped && source == SourceKind::NetworkSocket {
        if let Some((host, after)) = rest.split_once(' ') {
            if !host.is_empty() {
                record.set(keys::HOST, host);
                rest = after;
            }
        }
    }

    match split_tag(rest) {
        Some((sender, pid, message)) => {
            record.set(keys::SENDER, sender);
            if let Some(pid) = pid {
                record.set(keys::PID, pid);
            }
            record.set(keys::MESSAGE, message);
        }
        None => record.set(keys::MESSAGE, rest),
    }
    Some(record)
}

/// `sender[pid]: message` or `sender: message`.
fn split_tag(text: &str) -> Option<(&str, Option<&str>, &str)> {
    let (tag, message) = text.split_once(':')?;
    if tag.is_empty() || tag.contains(char::is_whitespace) {
        return None;
    }
    let message = message.strip_prefix(' ').unwrap_or(message);
    match tag.split_once('[') {
        Some((sender, pid)) => {
            let pid = pid.strip_suffix(']')?;
            if sender.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            Some((sender, Some(pid), message))
        }
        None => Some((tag, None, message)),
    }
}

/// `Mmm dd hh:mm:ss` in the local zone, in the current year.
fn parse_bsd_time(text: &str, now: DateTime<Local>) -> Option<i64> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let naive =
        NaiveDateTime::parse_from_str(&format!("{} {normalized}", now.year()), "%Y %b %d %H:%M:%S")
            .ok()?;
    let stamp = Local.from_local_datetime(&naive).earliest()?.timestamp();
    // A December record read in early January belongs to last year.
    if stamp > now.timestamp() + 86_400 {
        let naive = naive.with_year(now.year() - 1)?;
        return Some(Local.from_local_datetime(&naive).earliest()?.timestamp());
    }
    Some(stamp)
}

/// `[Key Value] ...`, optionally preceded by a 10-digit length and a space.
pub fn parse_raw(text: &str) -> Option<LogRecord> {
    let text = text.trim_end_matches(['\n', '\0']);
    let body = match text.as_bytes().get(..11) {
        Some(head) if head[..10].iter().all(u8::is_ascii_digit) && head[10] == b' ' => &text[11..],
        _ => text,
    };
    body.trim().parse::<LogRecord>().ok().filter(|r| !r.is_empty())
}

/// A datagram from the local socket or UDP: raw records first, legacy text
/// otherwise.
pub fn decode_datagram(bytes: &[u8], source: SourceKind) -> Option<LogRecord> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_start();
    let looks_raw = trimmed.starts_with('[')
        || trimmed.as_bytes().get(..10).is_some_and(|h| h.iter().all(u8::is_ascii_digit));
    if looks_raw {
        if let Some(record) = parse_raw(trimmed) {
            return Some(record);
        }
    }
    parse_legacy(&text, source, Local::now())
}

/// One kernel line: `/dev/kmsg` form `pri,seq,usec,flags;msg` or `<pri>msg`.
/// Continuation lines (leading space) carry key=value metadata and are
/// skipped.
pub fn parse_kernel_line(line: &str) -> Option<LogRecord> {
    let line = line.trim_end_matches(['\n', '\r', '\0']);
    if line.is_empty() || line.starts_with(' ') {
        return None;
    }

    let (pri, message) = if let Some((head, message)) = line
        .split_once(';')
        .filter(|(head, _)| head.split(',').count() >= 3)
    {
        (head.split(',').next()?.parse::<u32>().ok()?, message)
    } else if let Some((pri, message)) = line.strip_prefix('<').and_then(|s| s.split_once('>')) {
        (pri.parse::<u32>().ok()?, message)
    } else {
        (5, line)
    };

    Some(LogRecord::from_pairs([
        (keys::LEVEL, (pri & 7).to_string()),
        (keys::FACILITY, facility_name(pri >> 3).to_string()),
        (keys::SENDER, "kernel".to_string()),
        (keys::MESSAGE, message.to_string()),
    ]))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn idle_until_shutdown(mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
    let _ = shutdown_rx.recv().await;
    Ok(())
}

async fn submit_or_count(ctx: &DaemonContext, record: Option<LogRecord>, source: SourceKind) {
    match record {
        Some(record) => {
            ctx.submit(record, source, None).await;
        }
        None => {
            Counters::bump(&ctx.counters.dropped_malformed);
            tracing::debug!(%source, "dropping malformed input");
        }
    }
}

fn bind_datagram(socket: &Path) -> Result<UnixDatagram, DaemonError> {
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    prepare_socket_for_bind(socket)?;
    let sock = UnixDatagram::bind(socket).map_err(|e| io_err(socket, e))?;
    set_socket_permissions(socket, 0o666)?;
    Ok(sock)
}

/// The legacy `syslog(3)` datagram socket.
pub async fn local_socket_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let path = ctx.config.bsd_socket();
    let sock = match bind_datagram(&path) {
        Ok(sock) => sock,
        Err(err) => {
            tracing::warn!(error = %err, "local socket input disabled");
            return idle_until_shutdown(shutdown_rx).await;
        }
    };
    tracing::info!(socket = %path.display(), "local socket input listening");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            received = sock.recv(&mut buf) => {
                match received {
                    Ok(n) => {
                        let record = decode_datagram(&buf[..n], SourceKind::LocalSocket);
                        submit_or_count(&ctx, record, SourceKind::LocalSocket).await;
                    }
                    Err(err) => tracing::warn!(error = %err, "local socket receive failed"),
                }
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}

/// Network input, only when a bind address is configured.
pub async fn udp_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let Some(addr) = ctx.config.udp_bind.clone() else {
        return idle_until_shutdown(shutdown_rx).await;
    };
    let sock = match UdpSocket::bind(&addr).await {
        Ok(sock) => sock,
        Err(err) => {
            tracing::warn!(addr = %addr, error = %err, "udp input disabled");
            return idle_until_shutdown(shutdown_rx).await;
        }
    };
    tracing::info!(addr = %addr, "udp input listening");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            received = sock.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer)) => {
                        let record = decode_datagram(&buf[..n], SourceKind::NetworkSocket);
                        tracing::trace!(%peer, bytes = n, "udp datagram");
                        submit_or_count(&ctx, record, SourceKind::NetworkSocket).await;
                    }
                    Err(err) => tracing::warn!(error = %err, "udp receive failed"),
                }
            }
        }
    }
    Ok(())
}

/// Kernel messages, only when a device is configured and readable.
pub async fn kernel_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let Some(device) = ctx.config.kernel_device.clone() else {
        return idle_until_shutdown(shutdown_rx).await;
    };
    let file = match tokio::fs::File::open(&device).await {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(device = %device.display(), error = %err, "kernel input disabled");
            return idle_until_shutdown(shutdown_rx).await;
        }
    };
    tracing::info!(device = %device.display(), "kernel input reading");

    let mut lines = BufReader::new(file).lines();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    // Continuation lines are expected and not malformed.
                    if line.starts_with(' ') {
                        continue;
                    }
                    submit_or_count(&ctx, parse_kernel_line(&line), SourceKind::Kernel).await;
                }
                Ok(None) => break,
                // The ring overwrote records we had not read yet.
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    tracing::debug!("kernel ring overrun");
                }
                Err(err) => {
                    tracing::warn!(device = %device.display(), error = %err, "kernel read failed");
                    break;
                }
            },
        }
    }
    idle_until_shutdown(shutdown_rx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).single().expect("time")
    }

    #[test]
    fn legacy_line_with_everything() {
        let record = parse_legacy(
            "<13>Mar  1 04:00:00 box foo[42]: hello: world",
            SourceKind::NetworkSocket,
            now(),
        )
        .expect("record");
        assert_eq!(record.get(keys::LEVEL), Some("5"));
        assert_eq!(record.get(keys::FACILITY), Some("user"));
        assert_eq!(record.get(keys::HOST), Some("box"));
        assert_eq!(record.sender(), Some("foo"));
        assert_eq!(record.pid(), Some(42));
        assert_eq!(record.message(), Some("hello: world"));
        let expected = Local
            .with_ymd_and_hms(2024, 3, 1, 4, 0, 0)
            .single()
            .expect("time")
            .timestamp();
        assert_eq!(record.time(), Some(expected));
    }

    #[test]
    fn local_sources_have_no_host_field() {
        let record = parse_legacy("<30>Mar 10 11:59:00 foo: up", SourceKind::LocalSocket, now())
            .expect("record");
        assert_eq!(record.get(keys::FACILITY), Some("daemon"));
        assert_eq!(record.get(keys::LEVEL), Some("6"));
        assert_eq!(record.sender(), Some("foo"));
        assert!(!record.contains(keys::HOST));
        assert!(!record.contains(keys::PID));
    }

    #[rstest]
    #[case("just some text", None, "just some text")]
    #[case("<11>bar[7]: oops", Some("bar"), "oops")]
    #[case("not a tag: value", None, "not a tag: value")]
    fn legacy_without_header(
        #[case] line: &str,
        #[case] sender: Option<&str>,
        #[case] message: &str,
    ) {
        let record = parse_legacy(line, SourceKind::LocalSocket, now()).expect("record");
        assert_eq!(record.sender(), sender);
        assert_eq!(record.message(), Some(message));
    }

    #[test]
    fn december_records_in_january_belong_to_last_year() {
        let january = Local.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).single().expect("time");
        let stamp = parse_bsd_time("Dec 31 23:00:00", january).expect("stamp");
        let expected = Local
            .with_ymd_and_hms(2023, 12, 31, 23, 0, 0)
            .single()
            .expect("time")
            .timestamp();
        assert_eq!(stamp, expected);
    }

    #[test]
    fn raw_records_with_and_without_length_prefix() {
        let plain = parse_raw("[Sender foo] [Message hi there]").expect("plain");
        assert_eq!(plain.message(), Some("hi there"));

        let prefixed = parse_raw("0000000030 [Sender foo] [Message hi]").expect("prefixed");
        assert_eq!(prefixed.sender(), Some("foo"));

        let datagram = decode_datagram(b"[Sender foo] [Level 2]", SourceKind::LocalSocket)
            .expect("datagram");
        assert_eq!(datagram.get(keys::LEVEL), Some("2"));
        assert!(decode_datagram(b"   ", SourceKind::LocalSocket).is_none());
    }

    #[rstest]
    #[case("6,1234,5678,-;eth0: link up", "6", "eth0: link up")]
    #[case("<3>disk failure", "3", "disk failure")]
    #[case("plain kernel text", "5", "plain kernel text")]
    fn kernel_lines(#[case] line: &str, #[case] level: &str, #[case] message: &str) {
        let record = parse_kernel_line(line).expect("record");
        assert_eq!(record.get(keys::LEVEL), Some(level));
        assert_eq!(record.get(keys::FACILITY), Some("kern"));
        assert_eq!(record.sender(), Some("kernel"));
        assert_eq!(record.message(), Some(message));
    }

    #[test]
    fn kernel_continuation_lines_are_skipped() {
        assert!(parse_kernel_line(" SUBSYSTEM=net").is_none());
        assert!(parse_kernel_line("").is_none());
    }
}
