//! Behaviour every backend shares, plus file-store maintenance.

use std::time::{Duration, SystemTime};

use filetime::{set_file_mtime, FileTime};
use rstest::rstest;
use syslogd_core::{keys, Direction, LogRecord, Query};
use syslogd_store::{FileStore, LogStore, MiniStore, Reader, RingStore, StoreKind};
use tempfile::TempDir;

fn backend(kind: StoreKind, dir: &TempDir) -> Box<dyn LogStore> {
    let mut store: Box<dyn LogStore> = match kind {
        StoreKind::File => Box::new(FileStore::new(dir.path(), 0, 7)),
        StoreKind::Memory => Box::new(RingStore::new(1000, 1 << 20)),
        StoreKind::Mini => Box::new(MiniStore::new(1000)),
    };
    store.open().expect("open");
    store
}

fn record(id: u64, facility: Option<&str>) -> LogRecord {
    let mut r = LogRecord::from_pairs([
        (keys::MESSAGE_ID, id.to_string()),
        (keys::SENDER, "foo".to_string()),
        (keys::MESSAGE, format!("message {id}")),
    ]);
    if let Some(f) = facility {
        r.set(keys::FACILITY, f);
    }
    r
}

fn ids(records: &[LogRecord]) -> Vec<u64> {
    records.iter().filter_map(LogRecord::id).collect()
}

#[rstest]
#[case(StoreKind::File)]
#[case(StoreKind::Memory)]
#[case(StoreKind::Mini)]
fn exists_query_returns_ascending_ids(#[case] kind: StoreKind) {
    let dir = TempDir::new().expect("tempdir");
    let mut store = backend(kind, &dir);
    for id in 1..=30 {
        let facility = (id % 2 == 0).then_some("daemon");
        store.save(&record(id, facility)).expect("save");
    }

    let query = Query::parse("[T Facility]").expect("query");
    let page = store
        .query(&query, 0, 10, Direction::Forward, Reader::ROOT)
        .expect("query");
    assert_eq!(ids(&page.records), vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20]);
    assert_eq!(page.last_id, 20);

    let next = store
        .query(&query, page.last_id + 1, 10, Direction::Forward, Reader::ROOT)
        .expect("query");
    assert_eq!(ids(&next.records), vec![22, 24, 26, 28, 30]);
}

#[rstest]
#[case(StoreKind::File)]
#[case(StoreKind::Memory)]
#[case(StoreKind::Mini)]
fn acl_hides_restricted_records(#[case] kind: StoreKind) {
    let dir = TempDir::new().expect("tempdir");
    let mut store = backend(kind, &dir);
    let mut kernel = record(1, Some("kern"));
    kernel.set(keys::READ_UID, "0");
    kernel.set(keys::READ_GID, "80");
    store.save(&kernel).expect("save");
    store.save(&record(2, Some("user"))).expect("save");

    let user = store
        .query(&Query::all(), 0, 0, Direction::Forward, Reader::new(501, 20))
        .expect("query");
    assert_eq!(ids(&user.records), vec![2]);
    let admin = store
        .query(&Query::all(), 0, 0, Direction::Forward, Reader::new(501, 80))
        .expect("query");
    assert_eq!(ids(&admin.records), vec![1, 2]);
}

#[rstest]
#[case(StoreKind::File)]
#[case(StoreKind::Memory)]
fn statistics_name_the_backend(#[case] kind: StoreKind) {
    let dir = TempDir::new().expect("tempdir");
    let store = backend(kind, &dir);
    assert_eq!(store.statistics().get("Store"), Some(kind.name()));
}

#[test]
fn sweep_removes_files_past_retention_and_expired_files() {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("2001.01.01.asl"), b"").expect("write");
    std::fs::write(dir.path().join("E.2001.01.01.asl"), b"").expect("write");
    let mut store = FileStore::new(dir.path(), 0, 7);
    store.open().expect("open");
    store.save(&record(1, None)).expect("save");

    store.sweep(chrono::Utc::now().timestamp()).expect("sweep");
    assert!(!dir.path().join("2001.01.01.asl").exists());
    assert!(!dir.path().join("E.2001.01.01.asl").exists());
    assert_eq!(store.data_files().expect("files").len(), 1);
    assert!(dir.path().join("StoreData").exists());
}

#[test]
fn sweep_trims_oldest_files_over_size_cap() {
    let dir = TempDir::new().expect("tempdir");
    let today = chrono::Utc::now().date_naive();
    let old = dir.path().join(format!("{}.1.asl", today.format("%Y.%m.%d")));
    std::fs::write(&old, vec![b'x'; 4096]).expect("write");
    let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
    set_file_mtime(&old, FileTime::from_system_time(an_hour_ago)).expect("mtime");

    let mut store = FileStore::new(dir.path(), 1024, 0);
    store.open().expect("open");
    store.save(&record(1, None)).expect("save");
    store.sweep(chrono::Utc::now().timestamp()).expect("sweep");

    assert!(!old.exists(), "oldest file should be trimmed first");
    assert_eq!(store.data_files().expect("files").len(), 1);
}

#[test]
fn expired_records_are_not_returned() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = FileStore::new(dir.path(), 0, 7);
    store.open().expect("open");
    let mut stale = record(1, None);
    stale.set(keys::EXPIRE_TIME, "1000");
    store.save(&stale).expect("save");
    store.save(&record(2, None)).expect("save");
    let page = store
        .query(&Query::all(), 0, 0, Direction::Forward, Reader::ROOT)
        .expect("query");
    assert_eq!(ids(&page.records), vec![2]);
}
