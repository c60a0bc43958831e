//! Runtime parameters.
//!
//! Every parameter can be seeded from the YAML settings file and changed at
//! runtime by a `= name value` line (from a rule file, a control record, or
//! the RPC control request).

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::rules::parse_size;
use crate::types::Level;

pub const DEFAULT_MPS_LIMIT: u32 = 500;
pub const DEFAULT_DUP_DELAY_SECS: u64 = 30;
pub const DEFAULT_CLOSE_IDLE_SECS: u64 = 300;
pub const DEFAULT_TTL_SECS: u64 = 31_622_400;
pub const DEFAULT_STORE_TTL_DAYS: u32 = 7;
pub const DEFAULT_DB_FILE_MAX: u64 = 25_600_000;
pub const DEFAULT_DB_MEMORY_MAX: usize = 256;
pub const DEFAULT_DB_MEMORY_STR_MAX: usize = 4_096_000;
pub const DEFAULT_DB_MINI_MAX: usize = 256;
pub const DEFAULT_MAINTENANCE_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Store selection
// ---------------------------------------------------------------------------

/// Which storage backends are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreKinds {
    pub file: bool,
    pub memory: bool,
    pub mini: bool,
}

impl Default for StoreKinds {
    fn default() -> Self {
        Self {
            file: true,
            memory: false,
            mini: false,
        }
    }
}

impl StoreKinds {
    pub const NONE: StoreKinds = StoreKinds {
        file: false,
        memory: false,
        mini: false,
    };

    pub fn is_empty(&self) -> bool {
        !(self.file || self.memory || self.mini)
    }
}

impl TryFrom<String> for StoreKinds {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut kinds = StoreKinds::NONE;
        for part in value.split([',', '|', ' ']).filter(|p| !p.is_empty()) {
            match part.trim().to_ascii_lowercase().as_str() {
                "file" => kinds.file = true,
                "memory" | "mem" => kinds.memory = true,
                "mini" => kinds.mini = true,
                other => return Err(format!("unknown store type '{other}'")),
            }
        }
        if kinds.is_empty() {
            return Err(format!("no store type in '{value}'"));
        }
        Ok(kinds)
    }
}

impl From<StoreKinds> for String {
    fn from(kinds: StoreKinds) -> Self {
        kinds.to_string()
    }
}

impl fmt::Display for StoreKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.file, "file"),
            (self.memory, "memory"),
            (self.mini, "mini"),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, n)| *n)
        .collect();
        f.write_str(&names.join(","))
    }
}

// ---------------------------------------------------------------------------
// Level mask
// ---------------------------------------------------------------------------

/// Set of levels, bit `n` for level `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LevelMask(pub u8);

impl Default for LevelMask {
    fn default() -> Self {
        LevelMask::ALL
    }
}

impl LevelMask {
    pub const ALL: LevelMask = LevelMask(0xff);

    pub fn contains(self, level: Level) -> bool {
        self.0 & (1 << level.as_u8()) != 0
    }

    /// Mask of every level at or above `level`'s severity (0..=level).
    pub fn up_to(level: Level) -> LevelMask {
        LevelMask(((1u16 << (level.as_u8() + 1)) - 1) as u8)
    }

    /// Parse a level spec: filter letters (`pacewnid`), digits, digit
    /// ranges (`0-3`), or a hex mask (`0x1f`).
    pub fn parse(spec: &str) -> Result<LevelMask, String> {
        let spec = spec.trim();
        if let Some(hex) = spec.strip_prefix("0x") {
            return u8::from_str_radix(hex, 16)
                .map(LevelMask)
                .map_err(|_| format!("bad level mask '{spec}'"));
        }
        let mut mask = 0u8;
        let chars: Vec<char> = spec.chars().filter(|c| !matches!(c, ',' | ' ')).collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if let Some(lo) = c.to_digit(10) {
                let hi = if chars.get(i + 1) == Some(&'-') {
                    let hi = chars
                        .get(i + 2)
                        .and_then(|c| c.to_digit(10))
                        .ok_or_else(|| format!("bad level range in '{spec}'"))?;
                    i += 2;
                    hi
                } else {
                    lo
                };
                if lo > 7 || hi > 7 || lo > hi {
                    return Err(format!("bad level range in '{spec}'"));
                }
                for n in lo..=hi {
                    mask |= 1 << n;
                }
            } else if let Some(level) = Level::from_letter(c) {
                mask |= 1 << level.as_u8();
            } else {
                return Err(format!("unknown level '{c}' in '{spec}'"));
            }
            i += 1;
        }
        if mask == 0 {
            return Err(format!("empty level spec '{spec}'"));
        }
        Ok(LevelMask(mask))
    }
}

impl TryFrom<String> for LevelMask {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        LevelMask::parse(&value)
    }
}

impl From<LevelMask> for String {
    fn from(mask: LevelMask) -> Self {
        mask.to_string()
    }
}

impl fmt::Display for LevelMask {
    /// Filter letters, e.g. `pacew`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for level in Level::ALL {
            if self.contains(level) {
                write!(f, "{}", level.letter())?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

/// Every runtime-tunable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub debug: bool,
    pub debug_file: Option<PathBuf>,
    /// Per-sender records per second; 0 disables the quota.
    pub mps_limit: u32,
    /// Kernel records per second; 0 disables the kernel quota.
    pub kern_mps_limit: u32,
    /// Duplicate-suppression window for text files, in seconds.
    pub dup_delay: u64,
    /// Close destinations idle this long, in seconds.
    pub close_idle: u64,
    pub utmp_ttl: u64,
    pub fs_ttl: u64,
    /// Durable store retention in days.
    pub store_ttl: u32,
    pub db_type: StoreKinds,
    pub db_file_max: u64,
    pub db_memory_max: usize,
    pub db_memory_str_max: usize,
    pub db_mini_max: usize,
    /// Levels accepted into the main store.
    pub db_filter: LevelMask,
    /// Interval between `-- MARK --` records, 0 = off.
    pub mark_time: u64,
    /// Interval between store maintenance passes, in seconds.
    pub maintenance_interval: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            debug: false,
            debug_file: None,
            mps_limit: DEFAULT_MPS_LIMIT,
            kern_mps_limit: DEFAULT_MPS_LIMIT,
            dup_delay: DEFAULT_DUP_DELAY_SECS,
            close_idle: DEFAULT_CLOSE_IDLE_SECS,
            utmp_ttl: DEFAULT_TTL_SECS,
            fs_ttl: DEFAULT_TTL_SECS,
            store_ttl: DEFAULT_STORE_TTL_DAYS,
            db_type: StoreKinds::default(),
            db_file_max: DEFAULT_DB_FILE_MAX,
            db_memory_max: DEFAULT_DB_MEMORY_MAX,
            db_memory_str_max: DEFAULT_DB_MEMORY_STR_MAX,
            db_mini_max: DEFAULT_DB_MINI_MAX,
            db_filter: LevelMask::ALL,
            mark_time: 0,
            maintenance_interval: DEFAULT_MAINTENANCE_SECS,
        }
    }
}

/// Which subsystem a parameter change affects, so the daemon can react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamEffect {
    Debug,
    Quota,
    Output,
    Store,
    Timers,
}

impl Params {
    /// Apply `= name value`. Returns which subsystem needs to react.
    ///
    /// `reset` is not handled here; the daemon intercepts it.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<ParamEffect, CoreError> {
        let value = value.trim();
        let invalid = || CoreError::InvalidParam {
            name: name.to_string(),
            value: value.to_string(),
        };
        let effect = match name {
            "debug" => {
                let mut parts = value.split_whitespace();
                self.debug = parse_bool(parts.next().unwrap_or("1")).ok_or_else(invalid)?;
                if let Some(path) = parts.next() {
                    self.debug_file = Some(PathBuf::from(path));
                }
                ParamEffect::Debug
            }
            "debug_file" => {
                self.debug_file = (!value.is_empty()).then(|| PathBuf::from(value));
                ParamEffect::Debug
            }
            "mps_limit" => {
                self.mps_limit = value.parse().map_err(|_| invalid())?;
                ParamEffect::Quota
            }
            "kern_mps_limit" => {
                self.kern_mps_limit = value.parse().map_err(|_| invalid())?;
                ParamEffect::Quota
            }
            "dup_delay" | "bsd_max_dup_time" => {
                self.dup_delay = value.parse().map_err(|_| invalid())?;
                ParamEffect::Output
            }
            "close_idle" => {
                self.close_idle = value.parse().map_err(|_| invalid())?;
                ParamEffect::Output
            }
            "utmp_ttl" => {
                self.utmp_ttl = value.parse().map_err(|_| invalid())?;
                ParamEffect::Quota
            }
            "fs_ttl" => {
                self.fs_ttl = value.parse().map_err(|_| invalid())?;
                ParamEffect::Quota
            }
            "store_ttl" => {
                self.store_ttl = value.parse().map_err(|_| invalid())?;
                ParamEffect::Store
            }
            "db_type" => {
                self.db_type = StoreKinds::try_from(value.to_string()).map_err(|_| invalid())?;
                ParamEffect::Store
            }
            "db_file_max" => {
                self.db_file_max = parse_size(value).ok_or_else(invalid)?;
                ParamEffect::Store
            }
            "db_memory_max" => {
                self.db_memory_max = value.parse().map_err(|_| invalid())?;
                ParamEffect::Store
            }
            "db_memory_str_max" => {
                self.db_memory_str_max = parse_size(value).ok_or_else(invalid)? as usize;
                ParamEffect::Store
            }
            "db_mini_max" => {
                self.db_mini_max = value.parse().map_err(|_| invalid())?;
                ParamEffect::Store
            }
            "db_filter" => {
                self.db_filter = LevelMask::parse(value).map_err(|_| invalid())?;
                ParamEffect::Store
            }
            "mark_time" => {
                self.mark_time = value.parse().map_err(|_| invalid())?;
                ParamEffect::Timers
            }
            "maintenance_interval" | "asl_store_ping_time" => {
                self.maintenance_interval = value.parse().map_err(|_| invalid())?;
                ParamEffect::Timers
            }
            other => return Err(CoreError::UnknownParam(other.to_string())),
        };
        Ok(effect)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "on" | "yes" | "true" => Some(true),
        "0" | "off" | "no" | "false" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
