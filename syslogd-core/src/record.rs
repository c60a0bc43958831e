//! The normalized key/value log record.
//!
//! A [`LogRecord`] is an insertion-ordered map of unique string keys to
//! string values. Producers build one, the verifier normalizes it, and from
//! the moment it is enqueued it travels as `Arc<LogRecord>` and is never
//! mutated in place again (actions that change a record work on a copy).

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;
use crate::types::Level;

/// Well-known record keys.
pub mod keys {
    pub const TIME: &str = "Time";
    pub const TIME_NSEC: &str = "TimeNanoSec";
    pub const HOST: &str = "Host";
    pub const SENDER: &str = "Sender";
    pub const PID: &str = "PID";
    pub const UID: &str = "UID";
    pub const GID: &str = "GID";
    pub const LEVEL: &str = "Level";
    pub const FACILITY: &str = "Facility";
    pub const MESSAGE: &str = "Message";
    pub const READ_UID: &str = "ReadUID";
    pub const READ_GID: &str = "ReadGID";
    pub const MODULE: &str = "ASLModule";
    pub const EXPIRE_TIME: &str = "ASLExpireTime";
    pub const MESSAGE_ID: &str = "ASLMessageID";
    pub const REF_PID: &str = "RefPID";
    pub const REF_PROC: &str = "RefProc";
    pub const AUX_URL: &str = "ASLAuxURL";
    pub const SOURCE: &str = "ASLSource";
}

/// An ordered mapping of unique string keys to string values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    fields: Vec<(String, String)>,
}

impl LogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from key/value pairs; later duplicates replace earlier
    /// values but keep the first position.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut record = Self::new();
        for (k, v) in pairs {
            record.set(k, v);
        }
        record
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    /// Set `key` to `value`, replacing any existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Set `key` only if it is not already present.
    pub fn set_default(&mut self, key: &str, value: impl Into<String>) {
        if !self.contains(key) {
            self.fields.push((key.to_string(), value.into()));
        }
    }

    pub fn unset(&mut self, key: &str) -> Option<String> {
        let pos = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Approximate memory footprint of keys and values, used by the memory
    /// backends for their byte caps.
    pub fn byte_size(&self) -> usize {
        self.fields.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    // -- typed accessors ---------------------------------------------------

    pub fn level(&self) -> Level {
        Level::from_record_value(self.get(keys::LEVEL))
    }

    pub fn message(&self) -> Option<&str> {
        self.get(keys::MESSAGE)
    }

    pub fn sender(&self) -> Option<&str> {
        self.get(keys::SENDER)
    }

    /// Store-assigned id, once the record has been saved.
    pub fn id(&self) -> Option<u64> {
        self.get_parsed(keys::MESSAGE_ID)
    }

    /// Seconds since the epoch.
    pub fn time(&self) -> Option<i64> {
        self.get_parsed(keys::TIME)
    }

    pub fn pid(&self) -> Option<i64> {
        self.get_parsed(keys::PID)
    }

    pub fn uid(&self) -> Option<i64> {
        self.get_parsed(keys::UID)
    }

    pub fn gid(&self) -> Option<i64> {
        self.get_parsed(keys::GID)
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Whether a caller with `uid`/`gid` may read this record.
    ///
    /// Root reads everything. Otherwise a record is readable when it carries
    /// no restriction (`ReadUID`/`ReadGID` absent or `-1`), or when either
    /// ACL key names the caller.
    pub fn readable_by(&self, uid: i64, gid: i64) -> bool {
        if uid == 0 {
            return true;
        }
        let read_uid = self.get_parsed::<i64>(keys::READ_UID).filter(|v| *v != -1);
        let read_gid = self.get_parsed::<i64>(keys::READ_GID).filter(|v| *v != -1);
        match (read_uid, read_gid) {
            (None, None) => true,
            (ru, rg) => ru == Some(uid) || rg == Some(gid),
        }
    }
}

impl fmt::Display for LogRecord {
    /// Raw bracketed form: `[Key Value] [Key Value] ...`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "[{} {}]", escape_bracketed(k), escape_bracketed(v))?;
        }
        Ok(())
    }
}

/// Escape brackets, backslashes and newlines for the raw bracketed form.
pub fn escape_bracketed(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '[' | ']' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

impl std::str::FromStr for LogRecord {
    type Err = CoreError;

    /// Parse the raw bracketed form written by `Display`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| CoreError::Query(format!("bad record text: {reason}"));
        let mut record = LogRecord::new();
        let mut chars = text.chars().peekable();
        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            match chars.next() {
                None => break,
                Some('[') => {}
                Some(_) => return Err(bad("expected '['")),
            }
            let mut key = String::new();
            let mut value = String::new();
            let mut in_value = false;
            let mut closed = false;
            while let Some(c) = chars.next() {
                let c = match c {
                    '\\' => match chars.next() {
                        Some('n') => '\n',
                        Some(escaped) => escaped,
                        None => return Err(bad("dangling escape")),
                    },
                    ']' => {
                        closed = true;
                        break;
                    }
                    ' ' if !in_value => {
                        in_value = true;
                        continue;
                    }
                    c => c,
                };
                if in_value {
                    value.push(c);
                } else {
                    key.push(c);
                }
            }
            if !closed {
                return Err(bad("unterminated '['"));
            }
            if key.is_empty() {
                return Err(bad("empty key"));
            }
            record.set(key, value);
        }
        if record.is_empty() {
            return Err(bad("no fields"));
        }
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Serde: a JSON object that preserves key order
// ---------------------------------------------------------------------------

impl Serialize for LogRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LogRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = LogRecord;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<LogRecord, A::Error> {
                let mut record = LogRecord::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    record.set(k, v);
                }
                Ok(record)
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_in_place_and_keeps_order() {
        let mut r = LogRecord::new();
        r.set("A", "1");
        r.set("B", "2");
        r.set("A", "3");
        let pairs: Vec<_> = r.iter().collect();
        assert_eq!(pairs, vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn set_default_does_not_overwrite() {
        let mut r = LogRecord::from_pairs([(keys::SENDER, "foo")]);
        r.set_default(keys::SENDER, "bar");
        r.set_default(keys::HOST, "box");
        assert_eq!(r.sender(), Some("foo"));
        assert_eq!(r.get(keys::HOST), Some("box"));
    }

    #[test]
    fn json_preserves_key_order() {
        let r = LogRecord::from_pairs([("Z", "1"), ("A", "2"), ("M", "3")]);
        let json = serde_json::to_string(&r).unwrap_or_default();
        assert_eq!(json, r#"{"Z":"1","A":"2","M":"3"}"#);
        let back: LogRecord = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, r);
    }

    #[test]
    fn acl_filtering() {
        let open = LogRecord::from_pairs([(keys::READ_UID, "-1"), (keys::READ_GID, "-1")]);
        assert!(open.readable_by(501, 20));

        let bare = LogRecord::new();
        assert!(bare.readable_by(501, 20));

        let kernel = LogRecord::from_pairs([(keys::READ_UID, "0"), (keys::READ_GID, "80")]);
        assert!(!kernel.readable_by(501, 20));
        assert!(kernel.readable_by(501, 80));
        assert!(kernel.readable_by(0, 0));

        let user_only = LogRecord::from_pairs([(keys::READ_UID, "501")]);
        assert!(user_only.readable_by(501, 20));
        assert!(!user_only.readable_by(502, 20));
    }

    #[test]
    fn bracketed_text_parses_back() {
        let r = LogRecord::from_pairs([(keys::SENDER, "a]b"), (keys::MESSAGE, "two\nlines [x]")]);
        let back: LogRecord = r.to_string().parse().expect("parse");
        assert_eq!(back, r);
        assert!("[Sender x".parse::<LogRecord>().is_err());
        assert!("Sender x".parse::<LogRecord>().is_err());
    }

    #[test]
    fn display_is_raw_bracketed_form() {
        let r = LogRecord::from_pairs([(keys::SENDER, "a]b"), (keys::MESSAGE, "hi")]);
        assert_eq!(r.to_string(), r"[Sender a\]b] [Message hi]");
    }
}
