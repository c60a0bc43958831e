use std::fs;
use std::time::{Duration, Instant};

use chrono::Utc;
use syslogd_core::{keys, DestinationOptions, LogRecord};
use syslogd_output::{DestKind, DestinationManager, WriteOutcome};
use tempfile::TempDir;

const DUP_WINDOW: Duration = Duration::from_secs(30);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn from_foo(msg: &str) -> LogRecord {
    LogRecord::from_pairs([
        (keys::TIME, Utc::now().timestamp().to_string()),
        (keys::HOST, "box".to_string()),
        (keys::SENDER, "foo".to_string()),
        (keys::PID, "7".to_string()),
        (keys::LEVEL, "5".to_string()),
        (keys::MESSAGE, msg.to_string()),
    ])
}

fn read_lines(path: &std::path::Path) -> Vec<String> {
    fs::read_to_string(path)
        .expect("read destination")
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn duplicate_is_held_until_a_different_body_arrives() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let out = dir.path().join("out");
    let mut mgr = DestinationManager::new(DUP_WINDOW, Duration::ZERO);
    let id = mgr
        .resolve(&out, DestKind::Text, &DestinationOptions::default())
        .expect("resolve");

    let t0 = Instant::now();
    assert_eq!(mgr.write(id, &from_foo("hello"), t0), WriteOutcome::Written);
    mgr.reset_logged();
    assert_eq!(
        mgr.write(id, &from_foo("hello"), t0 + Duration::from_millis(100)),
        WriteOutcome::Suppressed
    );
    assert_eq!(read_lines(&out).len(), 1);

    mgr.reset_logged();
    mgr.write(id, &from_foo("different"), t0 + Duration::from_millis(200));
    let lines = read_lines(&out);
    assert_eq!(lines.len(), 3);
    assert!(lines[1].ends_with("--- last message repeated 1 time ---"), "{lines:?}");
    assert!(lines[2].ends_with("foo[7] <Notice>: different"));
}

#[test]
fn duplicate_flushes_when_the_window_runs_out() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let out = dir.path().join("out");
    let mut mgr = DestinationManager::new(DUP_WINDOW, Duration::ZERO);
    let id = mgr
        .resolve(&out, DestKind::Text, &DestinationOptions::default())
        .expect("resolve");

    let t0 = Instant::now();
    for step in 0..3u64 {
        mgr.reset_logged();
        mgr.write(id, &from_foo("hello"), t0 + Duration::from_millis(100 * step));
    }
    assert_eq!(mgr.next_deadline(), Some(t0 + DUP_WINDOW));

    assert_eq!(mgr.flush_due(t0 + Duration::from_secs(5)), 0);
    assert_eq!(mgr.flush_due(t0 + DUP_WINDOW), 1);
    assert_eq!(mgr.next_deadline(), None);

    let lines = read_lines(&out);
    assert_eq!(lines.len(), 2);
    assert!(lines[1].ends_with("--- last message repeated 2 times ---"));
}

#[test]
fn full_file_is_archived_and_reopened_empty() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let out = dir.path().join("app.log");
    let mut mgr = DestinationManager::new(Duration::ZERO, Duration::ZERO);
    let id = mgr
        .resolve(
            &out,
            DestKind::Text,
            &DestinationOptions::parse("file_max=64 style=seq"),
        )
        .expect("resolve");

    let long = "x".repeat(80);
    mgr.write(id, &from_foo(&long), Instant::now());
    let archive = dir.path().join("app.log.1");
    assert!(archive.exists(), "size crossing file_max triggers a checkpoint");
    assert!(!out.exists());
    assert_eq!(mgr.get(id).expect("dest").size(), 0);

    mgr.reset_logged();
    mgr.write(id, &from_foo("short"), Instant::now());
    assert_eq!(read_lines(&out).len(), 1);
    assert_eq!(read_lines(&archive).len(), 1);
}

#[test]
fn explicit_checkpoint_by_path() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let out = dir.path().join("app.log");
    let mut mgr = DestinationManager::new(Duration::ZERO, Duration::ZERO);
    let id = mgr
        .resolve(&out, DestKind::Text, &DestinationOptions::parse("style=sec"))
        .expect("resolve");
    mgr.write(id, &from_foo("one"), Instant::now());

    let now = Utc::now();
    assert!(mgr.checkpoint_path(&out, now));
    assert!(dir.path().join(format!("app.log.{}", now.timestamp())).exists());
    assert!(!mgr.checkpoint_path(&dir.path().join("missing"), now));
}

#[test]
fn statuses_are_serializable() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let mut mgr = DestinationManager::new(Duration::ZERO, Duration::ZERO);
    let id = mgr
        .resolve(&dir.path().join("r.asl"), DestKind::Records, &DestinationOptions::default())
        .expect("resolve");
    mgr.write(id, &from_foo("x"), Instant::now());

    let json = serde_json::to_value(mgr.statuses()).expect("json");
    assert_eq!(json[0]["kind"], "records");
    assert_eq!(json[0]["writes"], 1);
    assert_eq!(json[0]["disabled"], false);
}
