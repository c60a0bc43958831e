//! Record verification: normalize required fields, distrust unprivileged
//! credentials, apply the per-second quota.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use syslogd_core::{keys, Level, LogRecord, Params, SourceKind};
use syslogd_core::types::facility_name;

use crate::quota::{QuotaStatus, QuotaTable};

/// uid/gid recorded when the real value is unknown or untrusted.
pub const UNKNOWN_ID: i64 = -2;
/// The process supervisor; its records are attributed to `RefPID`.
pub const SUPERVISOR_PID: i64 = 1;
/// Group allowed to read kernel records.
pub const KERNEL_READ_GID: i64 = 80;
/// Kernel records at or below this level are mirrored to the disaster store.
pub const DISASTER_LEVEL: Level = Level::Error;
/// Level of the synthesized quota notice.
pub const NOTICE_LEVEL: Level = Level::Error;
/// Facilities only root may use.
pub const RESERVED_FACILITY_PREFIX: &str = "com.apple.system.";

const UTMP_FACILITY: &str = "com.apple.system.utmpx";
const FS_FACILITY: &str = "com.apple.system.fs";

/// Caller identity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: i64,
    pub gid: i64,
    pub pid: i64,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials {
        uid: 0,
        gid: 0,
        pid: 0,
    };

    pub const UNKNOWN: Credentials = Credentials {
        uid: UNKNOWN_ID,
        gid: UNKNOWN_ID,
        pid: 0,
    };

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

impl From<tokio::net::unix::UCred> for Credentials {
    fn from(cred: tokio::net::unix::UCred) -> Self {
        Credentials {
            uid: i64::from(cred.uid()),
            gid: i64::from(cred.gid()),
            pid: cred.pid().map(i64::from).unwrap_or(0),
        }
    }
}

/// What to do with a verified record.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept(LogRecord),
    /// The sender just went over quota; the record was rewritten into the
    /// one notice for this second.
    Notice(LogRecord),
    /// Over quota; discard silently.
    Drop,
}

#[derive(Debug, Default)]
pub struct Verifier {
    quota: Mutex<QuotaTable>,
    host: RwLock<Option<String>>,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The local hostname, cached until [`Verifier::invalidate_host`].
    pub fn host(&self) -> String {
        if let Some(host) = self.host.read().as_ref() {
            return host.clone();
        }
        let host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        *self.host.write() = Some(host.clone());
        host
    }

    /// Pin the hostname (tests, or a configured override).
    pub fn set_host(&self, host: impl Into<String>) {
        *self.host.write() = Some(host.into());
    }

    pub fn invalidate_host(&self) {
        *self.host.write() = None;
    }

    /// Fill and sanitize the well-known fields. `now` is seconds since the
    /// epoch.
    pub fn normalize(
        &self,
        record: &mut LogRecord,
        source: SourceKind,
        creds: Option<Credentials>,
        params: &Params,
        now: i64,
    ) {
        // PID
        let pid = match creds {
            Some(c) if c.pid > 0 => c.pid,
            _ => record.pid().unwrap_or(0),
        };
        let pid = match record.get_parsed::<i64>(keys::REF_PID) {
            Some(ref_pid) if pid == SUPERVISOR_PID => ref_pid,
            _ => pid,
        };
        record.set(keys::PID, pid.to_string());

        // Time
        match record.time() {
            Some(t) if t <= now => {}
            _ => {
                record.set(keys::TIME, now.to_string());
                record.unset(keys::TIME_NSEC);
            }
        }

        // Host
        if source == SourceKind::NetworkSocket {
            if !record.contains(keys::HOST) {
                record.set(keys::HOST, self.host());
            }
        } else {
            record.set(keys::HOST, self.host());
        }

        // UID / GID
        let (uid, gid) = match (source, creds) {
            (SourceKind::Kernel, _) => (0, 0),
            (_, Some(c)) => (c.uid, c.gid),
            (source, None) => {
                let claimed = |key| record.get_parsed::<i64>(key).unwrap_or(UNKNOWN_ID);
                let (uid, gid) = (claimed(keys::UID), claimed(keys::GID));
                if source.is_trusted() {
                    (uid, gid)
                } else {
                    (distrust(uid), distrust(gid))
                }
            }
        };
        record.set(keys::UID, uid.to_string());
        record.set(keys::GID, gid.to_string());

        // Sender
        if source == SourceKind::Kernel {
            record.set(keys::SENDER, source.default_sender());
        } else if record.sender().map_or(true, str::is_empty) {
            record.set(keys::SENDER, source.default_sender());
        }

        // Level
        let level = Level::from_record_value(record.get(keys::LEVEL));
        record.set(keys::LEVEL, level.as_digit());

        // Facility
        let facility = match record.get(keys::FACILITY) {
            None | Some("") => {
                if source == SourceKind::Kernel {
                    "kern".to_string()
                } else {
                    "user".to_string()
                }
            }
            Some(f) => match f.parse::<u32>() {
                Ok(code) => facility_name(code >> 3).to_string(),
                Err(_) => f.to_string(),
            },
        };
        let facility = if facility.starts_with(RESERVED_FACILITY_PREFIX) && uid != 0 {
            "user".to_string()
        } else {
            facility
        };
        record.set(keys::FACILITY, facility);

        // Read access
        if source == SourceKind::Kernel {
            record.set(keys::READ_UID, "0");
            record.set(keys::READ_GID, KERNEL_READ_GID.to_string());
        } else if !record.contains(keys::READ_UID) && !record.contains(keys::READ_GID) {
            record.set(keys::READ_UID, "-1");
            record.set(keys::READ_GID, "-1");
        }

        // Retention overrides
        if !record.contains(keys::EXPIRE_TIME) {
            let ttl = match record.get(keys::FACILITY) {
                Some(UTMP_FACILITY) => Some(params.utmp_ttl),
                Some(FS_FACILITY) => Some(params.fs_ttl),
                _ => None,
            };
            if let Some(ttl) = ttl.filter(|t| *t > 0) {
                let time = record.time().unwrap_or(now);
                let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
                record.set(keys::EXPIRE_TIME, time.saturating_add(ttl).to_string());
            }
        }
    }

    /// Normalize, then charge the quota unless `quota_active` is false
    /// (live watchers want everything).
    pub fn verify(
        &self,
        mut record: LogRecord,
        source: SourceKind,
        creds: Option<Credentials>,
        params: &Params,
        now: i64,
        quota_active: bool,
    ) -> Verdict {
        self.normalize(&mut record, source, creds, params, now);
        if !quota_active || source == SourceKind::Internal {
            return Verdict::Accept(record);
        }

        let status = {
            let mut quota = self.quota.lock();
            if source == SourceKind::Kernel {
                quota.check_kernel(now, params.kern_mps_limit)
            } else {
                quota.check(record.pid().unwrap_or(0), now, params.mps_limit)
            }
        };
        match status {
            QuotaStatus::Ok => Verdict::Accept(record),
            QuotaStatus::Drop => Verdict::Drop,
            QuotaStatus::Exceeded => {
                let text = if source == SourceKind::Kernel {
                    quota_notice("kernel", params.kern_mps_limit)
                } else {
                    let pid = record.pid().unwrap_or(0);
                    quota_notice(&format!("process {pid}"), params.mps_limit)
                };
                record.set(keys::MESSAGE, text);
                record.set(keys::LEVEL, NOTICE_LEVEL.as_digit());
                Verdict::Notice(record)
            }
        }
    }
}

/// Severe kernel records are mirrored to the disaster store.
pub fn is_disaster(record: &LogRecord, source: SourceKind) -> bool {
    source == SourceKind::Kernel && record.level() <= DISASTER_LEVEL
}

fn distrust(id: i64) -> i64 {
    if id == 0 {
        UNKNOWN_ID
    } else {
        id
    }
}

fn quota_notice(who: &str, limit: u32) -> String {
    format!(
        "*** {who} exceeded {limit} log message per second limit  -  remaining messages this second discarded ***"
    )
}
