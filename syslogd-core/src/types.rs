//! Domain types shared by every syslogd crate.
//!
//! Levels follow the classic syslog numbering (0 = Emergency … 7 = Debug).
//! Facilities arrive either as names or as the numeric codes carried in a
//! legacy `<pri>` header.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// Record severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Level {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Level {
    pub const ALL: [Level; 8] = [
        Level::Emergency,
        Level::Alert,
        Level::Critical,
        Level::Error,
        Level::Warning,
        Level::Notice,
        Level::Info,
        Level::Debug,
    ];

    /// Interpret a record's `Level` value.
    ///
    /// Only a single ASCII digit `0`–`7` is accepted verbatim; anything else,
    /// including a missing value, is [`Level::Debug`].
    pub fn from_record_value(value: Option<&str>) -> Level {
        match value.map(str::as_bytes) {
            Some([digit @ b'0'..=b'7']) => Level::from_u8(digit - b'0'),
            _ => Level::Debug,
        }
    }

    /// Level from the low three bits of a number (used for `<pri>` headers).
    pub fn from_u8(value: u8) -> Level {
        Level::ALL[(value & 0x07) as usize]
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The single-digit string stored in records.
    pub fn as_digit(self) -> &'static str {
        ["0", "1", "2", "3", "4", "5", "6", "7"][self as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            Level::Emergency => "Emergency",
            Level::Alert => "Alert",
            Level::Critical => "Critical",
            Level::Error => "Error",
            Level::Warning => "Warning",
            Level::Notice => "Notice",
            Level::Info => "Info",
            Level::Debug => "Debug",
        }
    }

    /// Console filter letter (`p`anic, `a`lert, `c`ritical, `e`rror,
    /// `w`arning, `n`otice, `i`nfo, `d`ebug).
    pub fn letter(self) -> char {
        ['p', 'a', 'c', 'e', 'w', 'n', 'i', 'd'][self as usize]
    }

    pub fn from_letter(c: char) -> Option<Level> {
        Level::ALL
            .iter()
            .copied()
            .find(|level| level.letter() == c.to_ascii_lowercase())
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if let Ok(n) = lower.parse::<u8>() {
            if n <= 7 {
                return Ok(Level::from_u8(n));
            }
        }
        Level::ALL
            .iter()
            .copied()
            .find(|level| level.name().eq_ignore_ascii_case(&lower))
            .or(match lower.as_str() {
                "panic" | "emerg" => Some(Level::Emergency),
                "crit" => Some(Level::Critical),
                "err" => Some(Level::Error),
                "warn" => Some(Level::Warning),
                _ => None,
            })
            .ok_or_else(|| format!("unknown level '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Facility
// ---------------------------------------------------------------------------

/// Facility names indexed by legacy facility code.
const FACILITY_NAMES: [&str; 25] = [
    "kern",
    "user",
    "mail",
    "daemon",
    "auth",
    "syslog",
    "lpr",
    "news",
    "uucp",
    "cron",
    "authpriv",
    "ftp",
    "netinfo",
    "remoteauth",
    "install",
    "ras",
    "local0",
    "local1",
    "local2",
    "local3",
    "local4",
    "local5",
    "local6",
    "local7",
    "launchd",
];

/// Map a numeric facility code to its name; unknown codes map to `user`.
pub fn facility_name(code: u32) -> &'static str {
    FACILITY_NAMES
        .get(code as usize)
        .copied()
        .unwrap_or("user")
}

// ---------------------------------------------------------------------------
// Source tag
// ---------------------------------------------------------------------------

/// Where a raw record entered the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Kernel,
    LocalSocket,
    NetworkSocket,
    Rpc,
    Internal,
}

impl SourceKind {
    /// Sources whose credentials come from the kernel or from the daemon
    /// itself rather than from the payload.
    pub fn is_trusted(self) -> bool {
        matches!(self, SourceKind::Kernel | SourceKind::Rpc | SourceKind::Internal)
    }

    /// Sender used when a record arrives without one.
    pub fn default_sender(self) -> &'static str {
        match self {
            SourceKind::Kernel => "kernel",
            SourceKind::Internal => "syslogd",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::Kernel => "kernel",
            SourceKind::LocalSocket => "local",
            SourceKind::NetworkSocket => "network",
            SourceKind::Rpc => "rpc",
            SourceKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Query direction
// ---------------------------------------------------------------------------

/// Scan direction for store queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_accepts_only_single_digit() {
        assert_eq!(Level::from_record_value(Some("3")), Level::Error);
        assert_eq!(Level::from_record_value(Some("0")), Level::Emergency);
        assert_eq!(Level::from_record_value(Some("8")), Level::Debug);
        assert_eq!(Level::from_record_value(Some("-1")), Level::Debug);
        assert_eq!(Level::from_record_value(Some("03")), Level::Debug);
        assert_eq!(Level::from_record_value(Some("Error")), Level::Debug);
        assert_eq!(Level::from_record_value(None), Level::Debug);
    }

    #[test]
    fn level_letters_round_trip() {
        for level in Level::ALL {
            assert_eq!(Level::from_letter(level.letter()), Some(level));
        }
        assert_eq!(Level::from_letter('x'), None);
    }

    #[test]
    fn level_from_str_accepts_names_and_digits() {
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!("crit".parse::<Level>().unwrap(), Level::Critical);
        assert_eq!("5".parse::<Level>().unwrap(), Level::Notice);
        assert!("11".parse::<Level>().is_err());
    }

    #[test]
    fn facility_codes_map_to_names() {
        assert_eq!(facility_name(0), "kern");
        assert_eq!(facility_name(3), "daemon");
        assert_eq!(facility_name(23), "local7");
        assert_eq!(facility_name(99), "user");
    }

    #[test]
    fn trusted_sources() {
        assert!(SourceKind::Kernel.is_trusted());
        assert!(SourceKind::Rpc.is_trusted());
        assert!(!SourceKind::NetworkSocket.is_trusted());
        assert!(!SourceKind::LocalSocket.is_trusted());
    }
}
