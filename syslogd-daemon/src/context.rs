//! Shared daemon state.
//!
//! One [`DaemonContext`] is built at startup and handed to every task as an
//! `Arc`. The storage lock covers the store set and the watcher set together;
//! the reset lock keeps reconfigurations from overlapping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};

use syslogd_core::params::ParamEffect;
use syslogd_core::{CoreError, DaemonConfig, Direction, LogRecord, Params, Query, SourceKind};
use syslogd_store::{QueryResult, Reader, StoreError, StoreKind, StoreSet};

use crate::debug::DebugSink;
use crate::error::DaemonError;
use crate::engine::EngineStatus;
use crate::queue::QueueItem;
use crate::verify::{is_disaster, Credentials, Verdict, Verifier};
use crate::watch::{SessionId, WatchEvent, WatchId, WatchSet};

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Counters {
    pub received: AtomicU64,
    pub enqueued: AtomicU64,
    pub processed: AtomicU64,
    pub stored: AtomicU64,
    pub dropped_quota: AtomicU64,
    pub quota_notices: AtomicU64,
    pub dropped_malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub enqueued: u64,
    pub processed: u64,
    pub stored: u64,
    pub dropped_quota: u64,
    pub quota_notices: u64,
    pub dropped_malformed: u64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            received: get(&self.received),
            enqueued: get(&self.enqueued),
            processed: get(&self.processed),
            stored: get(&self.stored),
            dropped_quota: get(&self.dropped_quota),
            quota_notices: get(&self.quota_notices),
            dropped_malformed: get(&self.dropped_malformed),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Outcome of handing a raw record to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Accepted,
    /// Over quota; the record went in as the quota notice.
    Notice,
    Dropped,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub sessions: usize,
    pub active_watchers: usize,
    pub debug: bool,
    pub counters: CounterSnapshot,
    pub params: Params,
    pub last_id: u64,
    pub stores: Vec<LogRecord>,
    /// `None` when the consumer did not answer in time.
    pub engine: Option<EngineStatus>,
}

/// Where a query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTarget {
    /// First usable configured backend.
    Primary,
    Store(StoreKind),
    Disaster,
}

impl QueryTarget {
    pub fn parse(name: Option<&str>) -> Result<QueryTarget, DaemonError> {
        match name {
            None => Ok(QueryTarget::Primary),
            Some("disaster") => Ok(QueryTarget::Disaster),
            Some(other) => StoreKind::parse(other)
                .map(QueryTarget::Store)
                .ok_or_else(|| DaemonError::Protocol(format!("unknown store '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct Storage {
    pub set: StoreSet,
    pub watchers: WatchSet,
}

pub struct DaemonContext {
    pub config: DaemonConfig,
    params: RwLock<Params>,
    storage: Mutex<Storage>,
    pub counters: Counters,
    pub verifier: Verifier,
    maintenance: AtomicBool,
    maintenance_notify: Notify,
    timers_changed: Notify,
    /// Held for the whole of a reconfiguration.
    pub reset_lock: tokio::sync::Mutex<()>,
    queue_tx: mpsc::Sender<QueueItem>,
    shutdown: broadcast::Sender<()>,
    sessions: Mutex<HashMap<SessionId, Credentials>>,
    next_session: AtomicU64,
    active_watchers: AtomicUsize,
    debug: DebugSink,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for DaemonContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonContext")
            .field("root", &self.config.root)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl DaemonContext {
    /// Open the stores and build the context. The receiver is the work
    /// queue's consumer end.
    pub fn new(
        config: DaemonConfig,
        debug: DebugSink,
        shutdown: broadcast::Sender<()>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<QueueItem>), DaemonError> {
        let params = config.params.clone();
        let set = StoreSet::open(&config.store_dir(), &params)?;
        if let Err(e) = debug.apply(&params, &config.debug_file()) {
            tracing::warn!(error = %e, "debug log unavailable");
        }
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let ctx = Arc::new(Self {
            config,
            params: RwLock::new(params),
            storage: Mutex::new(Storage {
                set,
                watchers: WatchSet::new(),
            }),
            counters: Counters::default(),
            verifier: Verifier::new(),
            maintenance: AtomicBool::new(false),
            maintenance_notify: Notify::new(),
            timers_changed: Notify::new(),
            reset_lock: tokio::sync::Mutex::new(()),
            queue_tx,
            shutdown,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
            active_watchers: AtomicUsize::new(0),
            debug,
            started_at: Utc::now(),
        });
        Ok((ctx, queue_rx))
    }

    pub fn params(&self) -> Params {
        self.params.read().clone()
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    // -- ingestion ---------------------------------------------------------

    /// Verify a raw record and enqueue it. Waits only for queue capacity.
    pub async fn submit(
        &self,
        raw: LogRecord,
        source: SourceKind,
        creds: Option<Credentials>,
    ) -> SubmitStatus {
        Counters::bump(&self.counters.received);
        let now = Utc::now().timestamp();
        let quota_active = self.active_watchers.load(Ordering::Relaxed) == 0;
        let verdict = {
            let params = self.params.read();
            self.verifier
                .verify(raw, source, creds, &params, now, quota_active)
        };
        let (record, status) = match verdict {
            Verdict::Accept(record) => (record, SubmitStatus::Accepted),
            Verdict::Notice(record) => {
                Counters::bump(&self.counters.quota_notices);
                (record, SubmitStatus::Notice)
            }
            Verdict::Drop => {
                Counters::bump(&self.counters.dropped_quota);
                return SubmitStatus::Dropped;
            }
        };

        // A quota notice is bookkeeping, not a disaster.
        if status != SubmitStatus::Notice && is_disaster(&record, source) {
            self.storage.lock().set.save_disaster(&record);
        }
        if self.enqueue(QueueItem::Record(record)).await.is_err() {
            return SubmitStatus::Dropped;
        }
        Counters::bump(&self.counters.enqueued);
        status
    }

    /// Put an item on the work queue.
    pub async fn enqueue(&self, item: QueueItem) -> Result<(), DaemonError> {
        self.queue_tx
            .send(item)
            .await
            .map_err(|_| DaemonError::ChannelClosed("work queue"))
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    // -- storage -----------------------------------------------------------

    /// Save to the main store and push the stored record to watchers.
    pub fn store(&self, record: &mut LogRecord) -> Option<u64> {
        let mut storage = self.storage.lock();
        let id = storage.set.save(record)?;
        Counters::bump(&self.counters.stored);
        if !storage.watchers.is_empty() {
            storage.watchers.publish(&Arc::new(record.clone()));
            self.active_watchers
                .store(storage.watchers.len(), Ordering::Relaxed);
        }
        Some(id)
    }

    pub fn query(
        &self,
        target: QueryTarget,
        query: &Query,
        start_id: u64,
        count: usize,
        direction: Direction,
        reader: Reader,
    ) -> Result<QueryResult, StoreError> {
        let storage = self.storage.lock();
        match target {
            QueryTarget::Primary => Ok(storage.set.query(query, start_id, count, direction, reader)),
            QueryTarget::Store(kind) => {
                storage
                    .set
                    .query_kind(kind, query, start_id, count, direction, reader)
            }
            QueryTarget::Disaster => {
                Ok(storage
                    .set
                    .query_disaster(query, start_id, count, direction, reader))
            }
        }
    }

    pub fn statistics(&self) -> Vec<LogRecord> {
        self.storage.lock().set.statistics()
    }

    pub fn last_id(&self) -> u64 {
        self.storage.lock().set.last_id()
    }

    pub fn sweep_stores(&self, now: i64) {
        self.storage.lock().set.sweep(now);
    }

    pub fn close_stores(&self) {
        self.storage.lock().set.close();
    }

    // -- watch -------------------------------------------------------------

    /// Register a watcher. With a start id the backlog of matching records
    /// from that id on is returned; the watcher then sees every later one.
    pub fn watch(
        &self,
        session: SessionId,
        query: Query,
        start_id: Option<u64>,
        reader: Reader,
        tx: mpsc::Sender<WatchEvent>,
    ) -> (WatchId, Vec<LogRecord>) {
        let mut storage = self.storage.lock();
        let backlog = match start_id {
            Some(start) => {
                storage
                    .set
                    .query(&query, start, 0, Direction::Forward, reader)
                    .records
            }
            None => Vec::new(),
        };
        let id = storage.watchers.add(session, query, reader, tx);
        self.active_watchers
            .store(storage.watchers.len(), Ordering::Relaxed);
        (id, backlog)
    }

    pub fn cancel_watch(&self, session: SessionId, id: WatchId) -> bool {
        let mut storage = self.storage.lock();
        let removed = storage.watchers.remove(session, id);
        self.active_watchers
            .store(storage.watchers.len(), Ordering::Relaxed);
        removed
    }

    pub fn active_watchers(&self) -> usize {
        self.active_watchers.load(Ordering::Relaxed)
    }

    // -- sessions ----------------------------------------------------------

    /// Register a caller. Dropping the guard releases its watchers.
    pub fn open_session(self: &Arc<Self>, creds: Credentials) -> SessionGuard {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.lock().insert(id, creds);
        tracing::debug!(session = id, uid = creds.uid, pid = creds.pid, "session opened");
        SessionGuard {
            ctx: Arc::clone(self),
            id,
            creds,
        }
    }

    pub fn sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    fn close_session(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
        let mut storage = self.storage.lock();
        let released = storage.watchers.remove_session(id);
        self.active_watchers
            .store(storage.watchers.len(), Ordering::Relaxed);
        drop(storage);
        tracing::debug!(session = id, released, "session closed");
    }

    // -- parameters --------------------------------------------------------

    /// Apply `= name value` and react to what changed. Output changes are
    /// left to the caller, which owns the destinations.
    pub fn apply_param(&self, name: &str, value: &str) -> Result<ParamEffect, CoreError> {
        let (effect, params) = {
            let mut params = self.params.write();
            let effect = params.apply(name, value)?;
            (effect, params.clone())
        };
        tracing::info!(param = name, value, "parameter set");
        self.react(effect, &params);
        Ok(effect)
    }

    /// Back to the configured parameters.
    pub fn reset_params(&self) -> Params {
        let params = self.config.params.clone();
        *self.params.write() = params.clone();
        for effect in [ParamEffect::Store, ParamEffect::Debug, ParamEffect::Timers] {
            self.react(effect, &params);
        }
        params
    }

    fn react(&self, effect: ParamEffect, params: &Params) {
        match effect {
            ParamEffect::Store => self.storage.lock().set.apply_params(params),
            ParamEffect::Debug => {
                if let Err(e) = self.debug.apply(params, &self.config.debug_file()) {
                    tracing::warn!(error = %e, "debug log unavailable");
                }
            }
            ParamEffect::Timers => self.timers_changed.notify_waiters(),
            ParamEffect::Quota | ParamEffect::Output => {}
        }
    }

    /// Resolves when a timer parameter changes.
    pub async fn timers_changed(&self) {
        self.timers_changed.notified().await;
    }

    // -- maintenance -------------------------------------------------------

    pub fn request_maintenance(&self) {
        self.maintenance.store(true, Ordering::Release);
        self.maintenance_notify.notify_one();
    }

    pub fn take_maintenance(&self) -> bool {
        self.maintenance.swap(false, Ordering::AcqRel)
    }

    pub async fn maintenance_requested(&self) {
        self.maintenance_notify.notified().await;
    }

    // -- status ------------------------------------------------------------

    pub async fn status(&self) -> DaemonStatus {
        let (tx, rx) = oneshot::channel();
        let engine = match self.enqueue(QueueItem::Status(tx)).await {
            Ok(()) => tokio::time::timeout(STATUS_TIMEOUT, rx)
                .await
                .ok()
                .and_then(Result::ok),
            Err(_) => None,
        };
        let (last_id, stores) = {
            let storage = self.storage.lock();
            (storage.set.last_id(), storage.set.statistics())
        };
        DaemonStatus {
            pid: std::process::id(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            queue_depth: self.queue_depth(),
            queue_capacity: self.queue_tx.max_capacity(),
            sessions: self.sessions(),
            active_watchers: self.active_watchers(),
            debug: self.debug.is_enabled(),
            counters: self.counters.snapshot(),
            params: self.params(),
            last_id,
            stores,
            engine,
        }
    }
}

/// A connected caller. Its watchers live exactly as long as this guard.
pub struct SessionGuard {
    ctx: Arc<DaemonContext>,
    id: SessionId,
    creds: Credentials,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn creds(&self) -> Credentials {
        self.creds
    }

    pub fn reader(&self) -> Reader {
        Reader::new(self.creds.uid, self.creds.gid)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.ctx.close_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{event_channel, WATCH_QUEUE_DEPTH};
    use syslogd_core::keys;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> (Arc<DaemonContext>, mpsc::Receiver<QueueItem>) {
        let mut config = DaemonConfig::with_root(dir.path());
        config.params.db_type = syslogd_core::StoreKinds {
            file: false,
            memory: true,
            mini: false,
        };
        let (shutdown, _) = broadcast::channel(4);
        DaemonContext::new(config, DebugSink::new(), shutdown).expect("context")
    }

    fn stored(ctx: &DaemonContext, msg: &str) -> u64 {
        let mut record = LogRecord::from_pairs([(keys::MESSAGE, msg), (keys::LEVEL, "5")]);
        ctx.store(&mut record).expect("stored")
    }

    #[test]
    fn watcher_sees_backlog_then_live_records_without_gaps() {
        let dir = TempDir::new().expect("tempdir");
        let (ctx, _rx) = context(&dir);
        let first = stored(&ctx, "one");
        stored(&ctx, "two");

        let session = ctx.open_session(Credentials::ROOT);
        let (tx, mut events) = event_channel();
        let (_, backlog) = ctx.watch(session.id(), Query::all(), Some(first + 1), Reader::ROOT, tx);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].message(), Some("two"));

        let third = stored(&ctx, "three");
        let event = events.try_recv().expect("live record");
        assert_eq!(event.record.id(), Some(third));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn dropping_the_session_releases_watchers() {
        let dir = TempDir::new().expect("tempdir");
        let (ctx, _rx) = context(&dir);
        let session = ctx.open_session(Credentials::ROOT);
        let (tx, _events) = event_channel();
        ctx.watch(session.id(), Query::all(), None, Reader::ROOT, tx);
        assert_eq!(ctx.active_watchers(), 1);
        assert_eq!(ctx.sessions(), 1);

        drop(session);
        assert_eq!(ctx.active_watchers(), 0);
        assert_eq!(ctx.sessions(), 0);
    }

    #[test]
    fn a_watcher_that_never_reads_is_released() {
        let dir = TempDir::new().expect("tempdir");
        let (ctx, _rx) = context(&dir);
        let session = ctx.open_session(Credentials::ROOT);
        let (tx, mut events) = event_channel();
        ctx.watch(session.id(), Query::all(), None, Reader::ROOT, tx);

        for n in 0..WATCH_QUEUE_DEPTH + 10 {
            stored(&ctx, &n.to_string());
        }
        assert_eq!(ctx.active_watchers(), 0);
        assert_eq!(ctx.sessions(), 1);

        let mut queued = 0;
        while events.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, WATCH_QUEUE_DEPTH);
    }

    #[test]
    fn store_params_reach_the_store_set() {
        let dir = TempDir::new().expect("tempdir");
        let (ctx, _rx) = context(&dir);
        let effect = ctx.apply_param("db_filter", "0-3").expect("param");
        assert_eq!(effect, ParamEffect::Store);

        let mut chatty = LogRecord::from_pairs([(keys::LEVEL, "6")]);
        assert_eq!(ctx.store(&mut chatty), None);

        ctx.reset_params();
        assert!(ctx.store(&mut chatty).is_some());
    }

    #[tokio::test]
    async fn submit_enqueues_verified_records() {
        let dir = TempDir::new().expect("tempdir");
        let (ctx, mut rx) = context(&dir);
        let raw = LogRecord::from_pairs([(keys::MESSAGE, "hi"), (keys::LEVEL, "12")]);
        let status = ctx.submit(raw, SourceKind::Rpc, Some(Credentials::ROOT)).await;
        assert_eq!(status, SubmitStatus::Accepted);
        match rx.recv().await {
            Some(QueueItem::Record(record)) => assert_eq!(record.get(keys::LEVEL), Some("7")),
            _ => panic!("expected a record"),
        }
        assert_eq!(ctx.counters.snapshot().enqueued, 1);
    }

    #[tokio::test]
    async fn severe_kernel_records_reach_the_disaster_ring() {
        let dir = TempDir::new().expect("tempdir");
        let (ctx, _rx) = context(&dir);
        let raw = LogRecord::from_pairs([(keys::MESSAGE, "panic"), (keys::LEVEL, "2")]);
        ctx.submit(raw, SourceKind::Kernel, None).await;
        let result = ctx
            .query(QueryTarget::Disaster, &Query::all(), 0, 0, Direction::Forward, Reader::ROOT)
            .expect("query");
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].message(), Some("panic"));
    }
}
