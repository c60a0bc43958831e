//! The rule/action engine.
//!
//! Runs on the work-queue consumer and nowhere else, so module state and
//! every destination handle are touched by one task only. Modules run in
//! definition order with the default module first. Within a module every
//! matching rule fires until a `skip` or `ignore`.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use syslogd_core::params::ParamEffect;
use syslogd_core::rules::builtin_default_rules;
use syslogd_core::{keys, Action, CoreError, LogRecord, ModuleConfig, Query, Rule, DEFAULT_MODULE};
use syslogd_output::{
    DestId, DestKind, DestinationManager, DestinationStatus, PathMonitor, WriteOutcome,
};
use syslogd_render::Formatter;

use crate::context::{Counters, DaemonContext};
use crate::control::{ControlLine, Target};
use crate::error::DaemonError;
use crate::queue::{clock, QueueItem};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Receives `notify` actions.
pub trait Notifier: Send {
    fn post(&mut self, key: &str);
}

/// Posts notifications to the daemon log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn post(&mut self, key: &str) {
        tracing::info!(key, "notification posted");
    }
}

/// Receives `broadcast` actions. `target` is `None` for "every terminal".
pub trait Broadcaster: Send {
    fn broadcast(&mut self, target: Option<&Path>, line: &str);
}

/// Writes to a terminal device, or to every pseudo-terminal.
#[derive(Debug, Default)]
pub struct TtyBroadcaster;

impl Broadcaster for TtyBroadcaster {
    fn broadcast(&mut self, target: Option<&Path>, line: &str) {
        let targets = match target {
            Some(path) => vec![path.to_path_buf()],
            None => terminals(Path::new("/dev/pts")),
        };
        let text = line.replace('\n', "\r\n");
        for path in targets {
            let written = OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|mut tty| tty.write_all(text.as_bytes()));
            if let Err(e) = written {
                tracing::debug!(path = %path.display(), error = %e, "broadcast failed");
            }
        }
    }
}

fn terminals(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().parse::<u32>().is_ok())
        .map(|e| e.path())
        .collect()
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub name: String,
    pub enabled: bool,
    pub rules: usize,
    pub disabled_rules: usize,
    pub claims: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub modules: Vec<ModuleStatus>,
    pub destinations: Vec<DestinationStatus>,
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RuleState {
    rule: Rule,
    dest: Option<DestId>,
    /// Set when the rule's destination was disabled; the rule then acts as
    /// `none`.
    disabled: bool,
    /// For skip rules injected into the default module: the claiming module.
    claimed_by: Option<String>,
}

#[derive(Debug)]
struct ModuleState {
    config: ModuleConfig,
    enabled: bool,
    rules: Vec<RuleState>,
}

impl ModuleState {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn claim_queries(&self) -> impl Iterator<Item = &Query> {
        self.config.claims().map(|r| &r.query)
    }

    fn claim_only(&self) -> bool {
        self.config
            .claims()
            .any(|r| matches!(r.action, Action::Claim { only: true }))
    }

    fn claims_record(&self, record: &LogRecord) -> bool {
        self.claim_queries().any(|q| q.matches(record))
    }

    fn dest_ids(&self) -> Vec<DestId> {
        let mut ids: Vec<DestId> = self.rules.iter().filter_map(|r| r.dest).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus {
            name: self.name().to_string(),
            enabled: self.enabled,
            rules: self.rules.len(),
            disabled_rules: self.rules.iter().filter(|r| r.disabled).count(),
            claims: self.config.claims().count(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Completed,
    /// `skip`, or `ignore` in the default module.
    Skipped,
    /// `ignore` anywhere else: no later module sees the record.
    Ignored,
}

fn dest_kind(action: &Action) -> Option<(&Path, DestKind)> {
    match action {
        Action::Store { path: Some(path) } => Some((path, DestKind::Records)),
        Action::StoreDirectory { path } => Some((path, DestKind::Directory)),
        Action::File { path } => Some((path, DestKind::Text)),
        _ => None,
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    ctx: Arc<DaemonContext>,
    modules: Vec<ModuleState>,
    dests: DestinationManager,
    notifier: Box<dyn Notifier>,
    broadcaster: Box<dyn Broadcaster>,
    broadcast_format: Formatter,
    /// Built-in control rules at the head of the default module; injected
    /// claim skips go right after them.
    builtin_rules: usize,
    /// Control lines raised by `control` actions, run once the record is done.
    deferred: Vec<String>,
}

impl Engine {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        let params = ctx.params();
        Self {
            ctx,
            modules: Vec::new(),
            dests: DestinationManager::new(secs(params.dup_delay), secs(params.close_idle)),
            notifier: Box::new(LogNotifier),
            broadcaster: Box::new(TtyBroadcaster),
            broadcast_format: Formatter::default(),
            builtin_rules: 0,
            deferred: Vec::new(),
        }
    }

    pub fn with_monitor(mut self, monitor: Box<dyn PathMonitor>) -> Self {
        self.dests = self.dests.with_monitor(monitor);
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Box<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn context(&self) -> &Arc<DaemonContext> {
        &self.ctx
    }

    // -- configuration -----------------------------------------------------

    /// Load the default module (built-ins plus `asl.conf`) and every module
    /// file, apply their parameter lines and resolve destinations.
    pub fn configure(&mut self) {
        self.modules.clear();
        let (mut default, _) = ModuleConfig::parse(DEFAULT_MODULE, builtin_default_rules());
        self.builtin_rules = default.rules.len();
        if let Some(conf) = load_module(&self.ctx.config.asl_conf(), Some(DEFAULT_MODULE)) {
            default.rules.extend(conf.rules);
        }

        let mut configs = vec![default];
        configs.extend(load_module_dir(&self.ctx.config.module_dir()));
        for config in configs {
            self.apply_config_params(&config);
            self.install(config);
        }
        self.inject_claims();
        tracing::info!(
            modules = self.modules.len(),
            destinations = self.dests.len(),
            "rules configured"
        );
    }

    fn apply_config_params(&mut self, config: &ModuleConfig) {
        for rule in &config.rules {
            match &rule.action {
                Action::SetParam { name, value } => self.set_param_logged(name, value),
                Action::SetParamIfExists { path, name, value } if path.exists() => {
                    self.set_param_logged(name, value)
                }
                _ => {}
            }
        }
    }

    fn install(&mut self, config: ModuleConfig) {
        let rules = config
            .rules
            .iter()
            .map(|rule| self.rule_state(&config, rule.clone()))
            .collect();
        self.modules.push(ModuleState {
            enabled: config.enabled,
            config,
            rules,
        });
    }

    fn rule_state(&mut self, config: &ModuleConfig, rule: Rule) -> RuleState {
        let mut disabled = false;
        let dest = match dest_kind(&rule.action) {
            Some((path, kind)) => match self.dests.resolve(path, kind, &config.options_for(path)) {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!(
                        module = %config.name,
                        path = %path.display(),
                        error = %e,
                        "destination unusable, rule disabled"
                    );
                    disabled = true;
                    None
                }
            },
            None => None,
        };
        RuleState {
            rule,
            dest,
            disabled,
            claimed_by: None,
        }
    }

    /// Every claim in a non-default module puts a matching skip into the
    /// default module, so claimed records stay out of the main store.
    fn inject_claims(&mut self) {
        let injected: Vec<RuleState> = self
            .modules
            .iter()
            .skip(1)
            .flat_map(|m| {
                m.claim_queries().map(move |query| RuleState {
                    rule: Rule::new(query.clone(), Action::Skip),
                    dest: None,
                    disabled: false,
                    claimed_by: Some(m.name().to_string()),
                })
            })
            .collect();
        if let Some(default) = self.modules.first_mut() {
            let at = self.builtin_rules.min(default.rules.len());
            default.rules.splice(at..at, injected);
        }
    }

    fn module_index(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.name() == name)
    }

    fn module_enabled(&self, name: &str) -> bool {
        self.module_index(name)
            .is_some_and(|idx| self.modules[idx].enabled)
    }

    // -- work queue --------------------------------------------------------

    pub fn handle(&mut self, item: QueueItem) {
        match item {
            QueueItem::Record(record) => self.process(record),
            QueueItem::Control { line, respond_to } => {
                let result = self.control(&line).map_err(|e| e.to_string());
                self.run_deferred();
                let _ = respond_to.send(result);
            }
            QueueItem::Reset(ack) => {
                self.reset();
                let _ = ack.send(());
            }
            QueueItem::Flush(ack) => {
                let _ = ack.send(());
            }
            QueueItem::Checkpoint => {
                let count = self.dests.checkpoint_all(Utc::now());
                tracing::info!(count, "daily checkpoint");
            }
            QueueItem::Status(respond_to) => {
                let _ = respond_to.send(self.status());
            }
        }
    }

    /// Route one record, then any diagnostics its writes produced.
    pub fn process(&mut self, record: LogRecord) {
        let mut pending = VecDeque::from([record]);
        while let Some(record) = pending.pop_front() {
            self.dispatch(record);
            Counters::bump(&self.ctx.counters.processed);
            pending.extend(self.dests.take_diagnostics());
            self.run_deferred();
        }
    }

    fn dispatch(&mut self, mut record: LogRecord) {
        let now = clock();
        let tagged = record
            .get(keys::MODULE)
            .filter(|m| *m != DEFAULT_MODULE)
            .map(str::to_string);
        let owner = match tagged {
            Some(_) => None,
            None => self.claim_owner(&record),
        };
        let mut offered = false;

        for idx in 0..self.modules.len() {
            let module = &self.modules[idx];
            if !module.enabled {
                continue;
            }
            let is_default = idx == 0;
            if tagged.as_deref().is_some_and(|t| t != module.name()) {
                continue;
            }
            if !is_default {
                if module.claim_only() && !module.claims_record(&record) {
                    continue;
                }
                if owner.is_some_and(|o| o != idx) && module.claims_record(&record) {
                    continue;
                }
            }

            self.dests.reset_logged();
            let flow = self.run_module(idx, &mut record, &mut offered, now);
            if is_default && flow == Flow::Completed && tagged.is_none() && !offered {
                offered = true;
                self.ctx.store(&mut record);
            }
            if flow == Flow::Ignored {
                break;
            }
        }
    }

    /// The first enabled non-default module whose claim matches.
    fn claim_owner(&self, record: &LogRecord) -> Option<usize> {
        self.modules
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, m)| m.enabled && m.claims_record(record))
            .map(|(idx, _)| idx)
    }

    fn run_module(
        &mut self,
        idx: usize,
        record: &mut LogRecord,
        offered: &mut bool,
        now: Instant,
    ) -> Flow {
        let is_default = idx == 0;
        for r in 0..self.modules[idx].rules.len() {
            let (action, dest) = {
                let state = &self.modules[idx].rules[r];
                if state.disabled || !state.rule.query.matches(record) {
                    continue;
                }
                if let Some(owner) = &state.claimed_by {
                    if !self.module_enabled(owner) {
                        continue;
                    }
                }
                (state.rule.action.clone(), state.dest)
            };

            match action {
                Action::None
                | Action::Claim { .. }
                | Action::SetParam { .. }
                | Action::SetParamIfExists { .. }
                | Action::DeclareDestination { .. } => {}
                Action::Skip => return Flow::Skipped,
                Action::Ignore if is_default => return Flow::Skipped,
                Action::Ignore => return Flow::Ignored,
                Action::Store { path: None } => {
                    if !*offered {
                        *offered = true;
                        self.ctx.store(record);
                    }
                }
                Action::Store { .. } | Action::StoreDirectory { .. } | Action::File { .. } => {
                    let Some(id) = dest else { continue };
                    if let WriteOutcome::Failed { disabled: true } = self.dests.write(id, record, now) {
                        self.modules[idx].rules[r].disabled = true;
                    }
                }
                Action::Notify { key } => self.notifier.post(&key),
                Action::Broadcast { target } => match self.broadcast_format.format(record) {
                    Ok(line) => self.broadcaster.broadcast(target.as_deref(), &line.text()),
                    Err(e) => tracing::warn!(error = %e, "cannot format broadcast"),
                },
                Action::Access { uid, gid } => {
                    if let Some(uid) = uid {
                        record.set(keys::READ_UID, uid.to_string());
                    }
                    if let Some(gid) = gid {
                        record.set(keys::READ_GID, gid.to_string());
                    }
                }
                Action::Control => {
                    if let Some(line) = record.message() {
                        self.deferred.push(line.to_string());
                    }
                }
                Action::SetKey { key, value } => record.set(key, value),
            }
        }
        Flow::Completed
    }

    fn run_deferred(&mut self) {
        for line in std::mem::take(&mut self.deferred) {
            if let Err(e) = self.control(&line) {
                tracing::warn!(error = %e, "control record rejected");
            }
        }
    }

    // -- control -----------------------------------------------------------

    pub fn control(&mut self, line: &str) -> Result<(), DaemonError> {
        tracing::debug!(line, "control");
        match line.parse::<ControlLine>()? {
            ControlLine::Reset => {
                let ctx = Arc::clone(&self.ctx);
                let guard = ctx.reset_lock.try_lock();
                match guard {
                    Ok(_guard) => self.reset(),
                    Err(_) => tracing::warn!("reset already in progress"),
                }
            }
            ControlLine::SetParam { name, value } => self.set_param(&name, &value)?,
            ControlLine::Enable { target, enabled } => self.enable(&target, enabled)?,
            ControlLine::Checkpoint { target, path } => self.checkpoint(&target, path.as_deref())?,
            ControlLine::DefineRule { module, line } => self.define_rule(&module, &line)?,
        }
        Ok(())
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), CoreError> {
        if self.ctx.apply_param(name, value)? == ParamEffect::Output {
            let params = self.ctx.params();
            self.dests
                .set_timing(secs(params.dup_delay), secs(params.close_idle));
        }
        Ok(())
    }

    fn set_param_logged(&mut self, name: &str, value: &str) {
        if let Err(e) = self.set_param(name, value) {
            tracing::warn!(error = %e, "ignoring parameter line");
        }
    }

    fn enable(&mut self, target: &Target, enabled: bool) -> Result<(), DaemonError> {
        match target {
            Target::All => {
                for module in self.modules.iter_mut().skip(1) {
                    module.enabled = enabled;
                }
            }
            Target::Module(name) => {
                let idx = self
                    .module_index(name)
                    .ok_or_else(|| DaemonError::Control(format!("no module '{name}'")))?;
                self.modules[idx].enabled = enabled;
            }
        }
        tracing::info!(?target, enabled, "module state changed");
        Ok(())
    }

    fn checkpoint(&mut self, target: &Target, path: Option<&Path>) -> Result<(), DaemonError> {
        let now = Utc::now();
        if let Some(path) = path {
            if !self.dests.checkpoint_path(path, now) {
                return Err(DaemonError::Control(format!(
                    "no destination {}",
                    path.display()
                )));
            }
            return Ok(());
        }
        let ids: Vec<DestId> = match target {
            Target::All => self.modules.iter().skip(1).flat_map(ModuleState::dest_ids).collect(),
            Target::Module(name) => {
                let idx = self
                    .module_index(name)
                    .ok_or_else(|| DaemonError::Control(format!("no module '{name}'")))?;
                self.modules[idx].dest_ids()
            }
        };
        for id in ids {
            if let Err(e) = self.dests.checkpoint(id, now) {
                tracing::warn!(error = %e, "checkpoint failed");
            }
        }
        Ok(())
    }

    /// `@ module <line>`: append a rule, creating the module if needed.
    fn define_rule(&mut self, module: &str, line: &str) -> Result<(), DaemonError> {
        let idx = match self.module_index(module) {
            Some(idx) => idx,
            None => {
                self.install(ModuleConfig::new(module));
                tracing::info!(module, "module created");
                self.modules.len() - 1
            }
        };
        let number = self.modules[idx].config.rules.len() + 1;
        let Some(rule) = Rule::parse_line(line, number)? else {
            return Ok(());
        };

        match &rule.action {
            Action::SetParam { name, value } => self.set_param(name, value)?,
            Action::SetParamIfExists { path, name, value } if path.exists() => {
                self.set_param(name, value)?
            }
            _ => {}
        }

        self.modules[idx].config.rules.push(rule.clone());
        let config = self.modules[idx].config.clone();
        let state = self.rule_state(&config, rule.clone());
        self.modules[idx].rules.push(state);

        if idx != 0 {
            if let Action::Claim { .. } = rule.action {
                let skip = RuleState {
                    rule: Rule::new(rule.query.clone(), Action::Skip),
                    dest: None,
                    disabled: false,
                    claimed_by: Some(module.to_string()),
                };
                let default = &mut self.modules[0];
                let at = self.builtin_rules.min(default.rules.len());
                default.rules.insert(at, skip);
            }
        }
        Ok(())
    }

    /// Back to the configured parameters, then rebuild every module.
    pub fn reset(&mut self) {
        tracing::info!("resetting configuration");
        self.dests.clear();
        let params = self.ctx.reset_params();
        self.dests
            .set_timing(secs(params.dup_delay), secs(params.close_idle));
        self.configure();
    }

    // -- timers ------------------------------------------------------------

    pub fn next_deadline(&self) -> Option<Instant> {
        self.dests.next_deadline()
    }

    /// Flush due repeat lines and close idle destinations.
    pub fn tick(&mut self, now: Instant) {
        self.dests.tick(now);
        for record in self.dests.take_diagnostics() {
            self.process(record);
        }
    }

    /// The periodic pass: store sweep, size checkpoints, idle close.
    pub fn maintain(&mut self) {
        let now = Utc::now();
        self.ctx.sweep_stores(now.timestamp());
        self.dests.checkpoint_full(now);
        self.dests.close_idle(clock());
    }

    pub fn path_deleted(&mut self, path: &Path) {
        self.dests.handle_deleted(path);
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            modules: self.modules.iter().map(ModuleState::status).collect(),
            destinations: self.dests.statuses(),
        }
    }

    /// Flush and close every destination and store.
    pub fn shutdown(&mut self) {
        self.dests.close_all();
        self.ctx.close_stores();
    }
}

fn load_module(path: &Path, name: Option<&str>) -> Option<ModuleConfig> {
    match ModuleConfig::load_at(path, name) {
        Ok((module, errors)) => {
            for e in errors {
                tracing::warn!(path = %path.display(), error = %e, "skipping rule line");
            }
            Some(module)
        }
        Err(CoreError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no rule file");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read rule file");
            None
        }
    }
}

/// One module per regular file, in file-name order.
fn load_module_dir(dir: &Path) -> Vec<ModuleConfig> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot read module directory");
            return Vec::new();
        }
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.path())
        .collect();
    paths.sort();
    paths
        .iter()
        .filter_map(|path| load_module(path, None))
        .filter(|module| {
            if module.is_default() {
                tracing::warn!(module = %module.name, "module file may not reuse the default name");
                return false;
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::QueryTarget;
    use crate::debug::DebugSink;
    use parking_lot::Mutex;
    use syslogd_core::{DaemonConfig, Direction, StoreKinds};
    use syslogd_store::Reader;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Harness {
        dir: TempDir,
        engine: Engine,
        notes: Arc<Mutex<Vec<String>>>,
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Notifier for Recorder {
        fn post(&mut self, key: &str) {
            self.0.lock().push(format!("notify {key}"));
        }
    }

    impl Broadcaster for Recorder {
        fn broadcast(&mut self, _target: Option<&Path>, line: &str) {
            self.0.lock().push(format!("wall {}", line.trim_end()));
        }
    }

    /// `asl.conf` plus module files, with `{dir}` replaced by the root.
    fn harness(asl_conf: &str, modules: &[(&str, &str)]) -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().display().to_string();
        let etc = dir.path().join("etc");
        std::fs::create_dir_all(etc.join("asl")).expect("etc");
        std::fs::write(etc.join("asl.conf"), asl_conf.replace("{dir}", &root)).expect("conf");
        for (name, text) in modules {
            std::fs::write(etc.join("asl").join(name), text.replace("{dir}", &root))
                .expect("module");
        }

        let mut config = DaemonConfig::with_root(dir.path());
        config.params.db_type = StoreKinds {
            file: false,
            memory: true,
            mini: false,
        };
        let (shutdown, _) = broadcast::channel(4);
        let (ctx, _rx) = DaemonContext::new(config, DebugSink::new(), shutdown).expect("context");
        let notes = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::new(ctx)
            .with_notifier(Box::new(Recorder(Arc::clone(&notes))))
            .with_broadcaster(Box::new(Recorder(Arc::clone(&notes))));
        engine.configure();
        Harness { dir, engine, notes }
    }

    fn record(sender: &str, msg: &str) -> LogRecord {
        LogRecord::from_pairs([
            (keys::TIME, "1700000000"),
            (keys::HOST, "box"),
            (keys::SENDER, sender),
            (keys::PID, "7"),
            (keys::UID, "501"),
            (keys::LEVEL, "5"),
            (keys::FACILITY, "user"),
            (keys::MESSAGE, msg),
        ])
    }

    fn control_record(line: &str) -> LogRecord {
        LogRecord::from_pairs([
            (keys::SENDER, "syslog"),
            (keys::UID, "0"),
            (keys::LEVEL, "5"),
            (keys::FACILITY, "com.apple.asl"),
            (keys::MESSAGE, line),
        ])
    }

    impl Harness {
        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn lines(&self, name: &str) -> Vec<String> {
            std::fs::read_to_string(self.path(name))
                .map(|s| s.lines().map(str::to_string).collect())
                .unwrap_or_default()
        }

        fn stored(&self) -> Vec<LogRecord> {
            self.engine
                .context()
                .query(QueryTarget::Primary, &Query::all(), 0, 0, Direction::Forward, Reader::ROOT)
                .expect("query")
                .records
        }
    }

    #[test]
    fn file_rule_writes_and_default_module_stores() {
        let mut h = harness("? [= Sender foo] file {dir}/foo.log\n", &[]);
        h.engine.process(record("foo", "one"));
        h.engine.process(record("bar", "two"));

        let lines = h.lines("foo.log");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("foo[7] <Notice>: one"));
        assert_eq!(h.stored().len(), 2);
    }

    #[test]
    fn skip_keeps_records_out_of_the_main_store() {
        let mut h = harness("? [= Sender noisy] skip\n", &[]);
        h.engine.process(record("noisy", "x"));
        h.engine.process(record("quiet", "y"));
        let stored = h.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender(), Some("quiet"));
    }

    #[test]
    fn explicit_store_saves_once() {
        let mut h = harness("? * store\n? [= Sender foo] store\n", &[]);
        h.engine.process(record("foo", "x"));
        assert_eq!(h.stored().len(), 1);
    }

    #[test]
    fn ignore_outside_the_default_module_stops_later_modules() {
        let mut h = harness(
            "",
            &[
                ("a", "? [= Sender foo] ignore\n"),
                ("b", "? * file {dir}/b.log\n"),
            ],
        );
        h.engine.process(record("foo", "x"));
        h.engine.process(record("bar", "y"));
        let lines = h.lines("b.log");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("y"));
        assert_eq!(h.stored().len(), 2, "the default module ran first");
    }

    #[test]
    fn ignore_in_the_default_module_acts_as_skip() {
        let mut h = harness("? [= Sender foo] ignore\n", &[("b", "? * file {dir}/b.log\n")]);
        h.engine.process(record("foo", "x"));
        assert!(h.stored().is_empty());
        assert_eq!(h.lines("b.log").len(), 1);
    }

    #[test]
    fn claimed_records_leave_the_default_module() {
        let mut h = harness(
            "? * file {dir}/all.log\n",
            &[(
                "claimer",
                "? [= Sender foo] claim only\n? * file {dir}/claimed.log\n",
            )],
        );
        h.engine.process(record("foo", "mine"));
        h.engine.process(record("bar", "yours"));

        assert_eq!(h.lines("claimed.log").len(), 1);
        let all = h.lines("all.log");
        assert_eq!(all.len(), 1);
        assert!(all[0].ends_with("yours"));
        let stored = h.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender(), Some("bar"));
    }

    #[test]
    fn disabling_the_claimer_releases_its_records() {
        let mut h = harness("", &[("claimer", "? [= Sender foo] claim only\n")]);
        h.engine.control("@ claimer enable 0").expect("disable");
        h.engine.process(record("foo", "x"));
        assert_eq!(h.stored().len(), 1);
    }

    #[test]
    fn tagged_records_only_reach_their_module() {
        let mut h = harness(
            "? * file {dir}/all.log\n",
            &[
                ("m1", "? * file {dir}/m1.log\n"),
                ("m2", "? * file {dir}/m2.log\n"),
            ],
        );
        let mut tagged = record("foo", "x");
        tagged.set(keys::MODULE, "m2");
        h.engine.process(tagged);

        assert!(h.lines("all.log").is_empty());
        assert!(h.lines("m1.log").is_empty());
        assert_eq!(h.lines("m2.log").len(), 1);
        assert!(h.stored().is_empty());
    }

    #[test]
    fn control_records_toggle_modules_and_are_not_stored() {
        let mut h = harness("", &[("m", "? [= Sender foo] file {dir}/m.log\n")]);
        h.engine.process(control_record("@ m enable 0"));
        h.engine.process(record("foo", "x"));
        assert!(h.lines("m.log").is_empty());
        assert_eq!(h.stored().len(), 1, "only the ordinary record");

        h.engine.process(control_record("@ * enable 1"));
        h.engine.process(record("foo", "y"));
        assert_eq!(h.lines("m.log").len(), 1);
    }

    #[test]
    fn control_from_non_root_is_just_a_record() {
        let mut h = harness("", &[("m", "? * file {dir}/m.log\n")]);
        let mut forged = control_record("@ m enable 0");
        forged.set(keys::UID, "501");
        h.engine.process(forged);
        h.engine.process(record("foo", "x"));
        assert_eq!(h.lines("m.log").len(), 2);
    }

    #[test]
    fn rules_can_be_defined_live() {
        let mut h = harness("", &[]);
        let line = format!("@ live ? [= Sender foo] file {}/live.log", h.dir.path().display());
        h.engine.control(&line).expect("define");
        h.engine.process(record("foo", "x"));
        assert_eq!(h.lines("live.log").len(), 1);
        assert_eq!(h.engine.status().modules[1].name, "live");
    }

    #[test]
    fn parameter_lines_apply_and_reset_restores_them() {
        let mut h = harness("= mps_limit 3\n", &[]);
        assert_eq!(h.engine.context().params().mps_limit, 3);

        h.engine.control("= mps_limit 9").expect("set");
        assert_eq!(h.engine.context().params().mps_limit, 9);
        assert!(h.engine.control("= no_such_param 1").is_err());

        h.engine.control("= reset").expect("reset");
        assert_eq!(h.engine.context().params().mps_limit, 3);
    }

    #[test]
    fn notify_broadcast_access_and_set_actions() {
        let mut h = harness(
            "? [= Sender foo] notify com.example.foo\n\
             ? [= Sender foo] broadcast\n\
             ? [= Sender foo] set Tag seen\n\
             ? [= Sender foo] access 0 80\n",
            &[],
        );
        h.engine.process(record("foo", "x"));

        let notes = h.notes.lock().clone();
        assert_eq!(notes[0], "notify com.example.foo");
        assert!(notes[1].starts_with("wall ") && notes[1].ends_with("foo[7] <Notice>: x"));
        let stored = h.stored();
        assert_eq!(stored[0].get("Tag"), Some("seen"));
        assert_eq!(stored[0].get(keys::READ_GID), Some("80"));
    }

    #[test]
    fn explicit_checkpoint_rotates_module_destinations() {
        let mut h = harness("", &[("m", "? * file {dir}/m.log\n")]);
        h.engine.process(record("foo", "x"));
        h.engine.control("@ m checkpoint").expect("checkpoint");
        assert!(h.path("m.log.1").exists());
        assert!(h.engine.control("@ nope checkpoint").is_err());
    }
}
