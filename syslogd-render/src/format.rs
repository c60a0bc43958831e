//! Record formats: `std`, `bsd`, `raw`, `msg`, `json`, and `$(Key)` templates.
//!
//! | Format | Output                                                    |
//! |--------|-----------------------------------------------------------|
//! | std    | `<time> <host> <sender>[<pid>] <<Level>>: <message>`      |
//! | bsd    | `<time> <host> <sender>[<pid>]: <message>`                |
//! | raw    | `[Key Value] [Key Value] ...`                             |
//! | msg    | `<message>`                                               |
//! | json   | one JSON object per record                                |
//!
//! Anything else is a template: `$Key`, `$(Key)` and `$((Key)(modifier))`
//! are replaced by record values, `$$` is a literal dollar.

use std::str::FromStr;

use chrono::Utc;

use syslogd_core::{keys, LogRecord};

use crate::error::RenderError;
use crate::time::{format_time, TimeStyle};

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// The "safe" text encoding: embedded newlines become a newline plus tab so
/// continuation lines stay attached, other control characters become `^X`,
/// and trailing newlines are dropped.
pub fn encode_safe(text: &str) -> String {
    let text = text.trim_end_matches('\n');
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\n\t"),
            '\t' => out.push('\t'),
            c if (c as u32) < 0x20 => {
                out.push('^');
                out.push(char::from(b'@' + c as u8));
            }
            '\u{7f}' => out.push_str("^?"),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Key { key: String, modifier: Option<String> },
}

/// A parsed `$(Key)` template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, RenderError> {
        let fail = |reason: &str| RenderError::Template {
            template: source.to_string(),
            reason: reason.to_string(),
        };
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(pos) = rest.find('$') {
            literal.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];

            if let Some(after) = rest.strip_prefix('$') {
                literal.push('$');
                rest = after;
                continue;
            }
            let segment = if let Some(after) = rest.strip_prefix("((") {
                let close = after.find(')').ok_or_else(|| fail("unterminated '$(('"))?;
                let key = &after[..close];
                let tail = after[close + 1..]
                    .strip_prefix('(')
                    .ok_or_else(|| fail("expected '(' before modifier"))?;
                let end = tail.find("))").ok_or_else(|| fail("unterminated modifier"))?;
                rest = &tail[end + 2..];
                Segment::Key {
                    key: key.to_string(),
                    modifier: Some(tail[..end].to_string()),
                }
            } else if let Some(after) = rest.strip_prefix('(') {
                let close = after.find(')').ok_or_else(|| fail("unterminated '$('"))?;
                rest = &after[close + 1..];
                Segment::Key {
                    key: after[..close].to_string(),
                    modifier: None,
                }
            } else {
                let end = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                    .unwrap_or(rest.len());
                if end == 0 {
                    literal.push('$');
                    continue;
                }
                let key = rest[..end].to_string();
                rest = &rest[end..];
                Segment::Key { key, modifier: None }
            };
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            if let Segment::Key { key, .. } = &segment {
                if key.is_empty() {
                    return Err(fail("empty key"));
                }
            }
            segments.push(segment);
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let template = Self {
            source: source.to_string(),
            segments,
        };
        template.check_modifiers()?;
        Ok(template)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn check_modifiers(&self) -> Result<(), RenderError> {
        for segment in &self.segments {
            if let Segment::Key {
                key,
                modifier: Some(m),
            } = segment
            {
                if key == keys::TIME {
                    TimeStyle::from_str(m)?;
                }
            }
        }
        Ok(())
    }

    fn render(&self, record: &LogRecord, default_time: TimeStyle) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Key { key, modifier } => {
                    out.push_str(&render_key(record, key, modifier.as_deref(), default_time))
                }
            }
        }
        out
    }
}

fn render_key(record: &LogRecord, key: &str, modifier: Option<&str>, default_time: TimeStyle) -> String {
    match key {
        keys::TIME => {
            let style = modifier
                .and_then(|m| m.parse().ok())
                .unwrap_or(default_time);
            record
                .time()
                .map(|t| format_time(t, style))
                .unwrap_or_default()
        }
        keys::LEVEL => {
            let level = record.level();
            match modifier {
                Some("str") | Some("name") => level.name().to_string(),
                Some("char") => level.letter().to_string(),
                _ => level.as_digit().to_string(),
            }
        }
        keys::MESSAGE => encode_safe(record.message().unwrap_or_default()),
        _ => record.get(key).map(encode_safe).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Format {
    Std,
    Bsd,
    Raw,
    Msg,
    Json,
    Template(Template),
}

impl Format {
    /// A format name, or a template if the name is not one of the built-ins.
    pub fn parse(name: &str) -> Result<Self, RenderError> {
        match name.trim() {
            "std" => Ok(Format::Std),
            "bsd" => Ok(Format::Bsd),
            "raw" | "asl" => Ok(Format::Raw),
            "msg" => Ok(Format::Msg),
            "json" => Ok(Format::Json),
            other => Template::parse(other).map(Format::Template),
        }
    }
}

/// One formatted record, split so duplicate suppression can compare the
/// body without the time prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedLine {
    pub prefix: String,
    pub body: String,
}

impl FormattedLine {
    /// The full line, newline-terminated.
    pub fn text(&self) -> String {
        if self.prefix.is_empty() {
            format!("{}\n", self.body)
        } else {
            format!("{} {}\n", self.prefix, self.body)
        }
    }
}

/// Formats records for a text destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Formatter {
    format: Format,
    time_style: TimeStyle,
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(Format::Std, TimeStyle::Legacy)
    }
}

impl Formatter {
    pub fn new(format: Format, time_style: TimeStyle) -> Self {
        Self { format, time_style }
    }

    /// Build from destination options (`format=`, `time_format=`).
    pub fn from_options(format: Option<&str>, time_format: Option<&str>) -> Result<Self, RenderError> {
        let format = format.map(Format::parse).transpose()?.unwrap_or(Format::Std);
        let time_style = time_format
            .map(str::parse)
            .transpose()?
            .unwrap_or(TimeStyle::Legacy);
        Ok(Self::new(format, time_style))
    }

    pub fn format_kind(&self) -> &Format {
        &self.format
    }

    pub fn time_style(&self) -> TimeStyle {
        self.time_style
    }

    pub fn format(&self, record: &LogRecord) -> Result<FormattedLine, RenderError> {
        let line = match &self.format {
            Format::Std | Format::Bsd => FormattedLine {
                prefix: self.time_prefix(record),
                body: self.header_body(record),
            },
            Format::Raw => FormattedLine {
                prefix: String::new(),
                body: record.to_string(),
            },
            Format::Msg => FormattedLine {
                prefix: String::new(),
                body: encode_safe(record.message().unwrap_or_default()),
            },
            Format::Json => FormattedLine {
                prefix: String::new(),
                body: serde_json::to_string(record)?,
            },
            Format::Template(template) => FormattedLine {
                prefix: String::new(),
                body: template.render(record, self.time_style),
            },
        };
        Ok(line)
    }

    /// The synthesized line flushed when suppressed duplicates are pending.
    pub fn repeat_notice(&self, count: u32, now: i64) -> String {
        let body = format!(
            "--- last message repeated {count} time{} ---",
            if count == 1 { "" } else { "s" }
        );
        match self.format {
            Format::Std | Format::Bsd => format!("{} {body}\n", format_time(now, self.time_style)),
            _ => format!("{body}\n"),
        }
    }

    fn time_prefix(&self, record: &LogRecord) -> String {
        let secs = record.time().unwrap_or_else(|| Utc::now().timestamp());
        format_time(secs, self.time_style)
    }

    fn header_body(&self, record: &LogRecord) -> String {
        let mut body = String::new();
        if let Some(host) = record.get(keys::HOST) {
            body.push_str(host);
            body.push(' ');
        }
        body.push_str(record.sender().unwrap_or("Unknown"));
        if let Some(pid) = record.get(keys::PID) {
            body.push('[');
            body.push_str(pid);
            body.push(']');
        }
        if self.format == Format::Std {
            body.push_str(" <");
            body.push_str(record.level().name());
            body.push('>');
        }
        body.push_str(": ");
        body.push_str(&encode_safe(record.message().unwrap_or_default()));
        body
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record() -> LogRecord {
        LogRecord::from_pairs([
            (keys::TIME, "1700000000"),
            (keys::HOST, "box"),
            (keys::SENDER, "foo"),
            (keys::PID, "42"),
            (keys::LEVEL, "5"),
            (keys::MESSAGE, "hello"),
        ])
    }

    #[rstest]
    #[case("std", "1700000000 box foo[42] <Notice>: hello\n")]
    #[case("bsd", "1700000000 box foo[42]: hello\n")]
    #[case("msg", "hello\n")]
    #[case("$Sender:$(PID) $((Level)(str)) $$", "foo:42 Notice $\n")]
    #[case("$((Time)(utc)) $Message", "2023-11-14 22:13:20Z hello\n")]
    fn formats(#[case] format: &str, #[case] expected: &str) {
        let f = Formatter::from_options(Some(format), Some("sec")).unwrap();
        assert_eq!(f.format(&record()).unwrap().text(), expected);
    }

    #[test]
    fn std_body_excludes_the_time_prefix() {
        let f = Formatter::from_options(None, Some("utc")).unwrap();
        let line = f.format(&record()).unwrap();
        assert_eq!(line.prefix, "2023-11-14 22:13:20Z");
        assert_eq!(line.body, "box foo[42] <Notice>: hello");
    }

    #[test]
    fn raw_and_json_keep_every_key() {
        let raw = Formatter::from_options(Some("raw"), None).unwrap();
        assert!(raw.format(&record()).unwrap().body.starts_with("[Time 1700000000] [Host box]"));
        let json = Formatter::from_options(Some("json"), None).unwrap();
        let body = json.format(&record()).unwrap().body;
        let back: LogRecord = serde_json::from_str(&body).unwrap();
        assert_eq!(back, record());
    }

    #[test]
    fn safe_encoding() {
        assert_eq!(encode_safe("a\nb\n"), "a\n\tb");
        assert_eq!(encode_safe("bell\u{7}"), "bell^G");
    }

    #[test]
    fn repeat_notice_pluralizes() {
        let f = Formatter::from_options(Some("bsd"), Some("sec")).unwrap();
        assert_eq!(f.repeat_notice(1, 5), "5 --- last message repeated 1 time ---\n");
        assert_eq!(f.repeat_notice(3, 5), "5 --- last message repeated 3 times ---\n");
    }

    #[rstest]
    #[case("$(Sender")]
    #[case("$((Time)utc")]
    #[case("$((Time)(fortnight))")]
    fn bad_templates(#[case] text: &str) {
        assert!(Format::parse(text).is_err());
    }
}
