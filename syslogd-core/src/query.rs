//! Query predicates over record keys.
//!
//! # Syntax
//!
//! ```text
//! query   := "*" | clause+
//! clause  := "[" ops key [value] "]"
//! ops     := modifier* compare | modifier+ | "T"
//! compare := "=" | "!" | "!=" | "<" | "<=" | ">" | ">="
//! modifier:= "C" (casefold) | "N" (numeric) | "S" (substring)
//!          | "A" (prefix)   | "Z" (suffix)  | "R" (regex)
//! ```
//!
//! Clauses are ANDed. An empty query matches every record. A clause whose
//! key is missing from the record never matches, except `T` which tests
//! exactly that.

use std::cmp::Ordering;
use std::fmt;

use regex::{Regex, RegexBuilder};

use crate::error::CoreError;
use crate::record::LogRecord;

/// Comparison operator of a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Exists,
}

impl Op {
    fn token(self) -> &'static str {
        match self {
            Op::Equal => "=",
            Op::NotEqual => "!",
            Op::Less => "<",
            Op::LessEqual => "<=",
            Op::Greater => ">",
            Op::GreaterEqual => ">=",
            Op::Exists => "T",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            Op::Equal => ord == Ordering::Equal,
            Op::NotEqual => ord != Ordering::Equal,
            Op::Less => ord == Ordering::Less,
            Op::LessEqual => ord != Ordering::Greater,
            Op::Greater => ord == Ordering::Greater,
            Op::GreaterEqual => ord != Ordering::Less,
            Op::Exists => true,
        }
    }
}

/// Clause modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub casefold: bool,
    pub numeric: bool,
    pub substring: bool,
    pub prefix: bool,
    pub suffix: bool,
    pub regex: bool,
}

impl Modifiers {
    fn token(&self) -> String {
        let mut s = String::new();
        for (on, c) in [
            (self.casefold, 'C'),
            (self.numeric, 'N'),
            (self.substring, 'S'),
            (self.prefix, 'A'),
            (self.suffix, 'Z'),
            (self.regex, 'R'),
        ] {
            if on {
                s.push(c);
            }
        }
        s
    }
}

/// One `[op key value]` test.
#[derive(Debug, Clone)]
pub struct Clause {
    pub op: Op,
    pub modifiers: Modifiers,
    pub key: String,
    pub value: Option<String>,
    regex: Option<Regex>,
}

impl PartialEq for Clause {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op
            && self.modifiers == other.modifiers
            && self.key == other.key
            && self.value == other.value
    }
}

impl Clause {
    pub fn new(op: Op, modifiers: Modifiers, key: &str, value: Option<&str>) -> Result<Self, CoreError> {
        let regex = match (modifiers.regex, value) {
            (true, Some(pattern)) => Some(
                RegexBuilder::new(pattern)
                    .case_insensitive(modifiers.casefold)
                    .build()
                    .map_err(|source| CoreError::Regex {
                        pattern: pattern.to_string(),
                        source,
                    })?,
            ),
            (true, None) => {
                return Err(CoreError::Query(format!("regex clause on '{key}' has no pattern")))
            }
            _ => None,
        };
        if op != Op::Exists && value.is_none() {
            return Err(CoreError::Query(format!("clause on '{key}' has no value")));
        }
        Ok(Self {
            op,
            modifiers,
            key: key.to_string(),
            value: value.map(str::to_string),
            regex,
        })
    }

    /// Shorthand for `[= key value]`.
    pub fn equal(key: &str, value: &str) -> Self {
        Self {
            op: Op::Equal,
            modifiers: Modifiers::default(),
            key: key.to_string(),
            value: Some(value.to_string()),
            regex: None,
        }
    }

    /// Shorthand for `[T key]`.
    pub fn exists(key: &str) -> Self {
        Self {
            op: Op::Exists,
            modifiers: Modifiers::default(),
            key: key.to_string(),
            value: None,
            regex: None,
        }
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        let Some(actual) = record.get(&self.key) else {
            return false;
        };
        if self.op == Op::Exists {
            return true;
        }
        let expected = self.value.as_deref().unwrap_or_default();

        if let Some(re) = &self.regex {
            let hit = re.is_match(actual);
            return match self.op {
                Op::NotEqual => !hit,
                _ => hit,
            };
        }

        if self.modifiers.numeric {
            let (Ok(a), Ok(b)) = (actual.trim().parse::<i64>(), expected.trim().parse::<i64>()) else {
                return false;
            };
            return self.op.accepts(a.cmp(&b));
        }

        let (actual, expected) = if self.modifiers.casefold {
            (actual.to_lowercase(), expected.to_lowercase())
        } else {
            (actual.to_string(), expected.to_string())
        };

        let partial = if self.modifiers.substring {
            Some(actual.contains(&expected))
        } else if self.modifiers.prefix {
            Some(actual.starts_with(&expected))
        } else if self.modifiers.suffix {
            Some(actual.ends_with(&expected))
        } else {
            None
        };
        match partial {
            Some(hit) if self.op == Op::NotEqual => !hit,
            Some(hit) => hit,
            None => self.op.accepts(actual.as_str().cmp(expected.as_str())),
        }
    }

    fn parse_body(body: &str) -> Result<Self, CoreError> {
        let mut tokens = Tokenizer::new(body);
        let ops = tokens
            .next_token()
            .ok_or_else(|| CoreError::Query("empty clause".to_string()))?;
        let (op, modifiers) = parse_ops(&ops)?;

        let key = match tokens.next_token() {
            Some(key) => key,
            None if op == Op::Exists && ops == "T" => {
                return Err(CoreError::Query("'T' clause needs a key".to_string()))
            }
            None => return Err(CoreError::Query(format!("clause '{body}' has no key"))),
        };
        let rest = tokens.rest().trim();
        let value = if rest.is_empty() {
            None
        } else {
            Some(unquote(rest))
        };
        Clause::new(op, modifiers, &key, value.as_deref())
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops = if self.op == Op::Exists {
            "T".to_string()
        } else {
            format!("{}{}", self.modifiers.token(), self.op.token())
        };
        write!(f, "[{} {}", ops, quote_if_needed(&self.key))?;
        if let Some(value) = &self.value {
            write!(f, " {}", quote_if_needed(value))?;
        }
        f.write_str("]")
    }
}

fn parse_ops(token: &str) -> Result<(Op, Modifiers), CoreError> {
    let mut modifiers = Modifiers::default();
    let mut compare = String::new();
    let mut exists = false;
    for c in token.chars() {
        match c {
            'C' => modifiers.casefold = true,
            'N' => modifiers.numeric = true,
            'S' => modifiers.substring = true,
            'A' => modifiers.prefix = true,
            'Z' => modifiers.suffix = true,
            'R' => modifiers.regex = true,
            'T' => exists = true,
            '=' | '!' | '<' | '>' => compare.push(c),
            other => {
                return Err(CoreError::Query(format!(
                    "unknown operator character '{other}' in '{token}'"
                )))
            }
        }
    }
    if exists {
        return Ok((Op::Exists, modifiers));
    }
    let op = match compare.as_str() {
        "" | "=" | "==" => Op::Equal,
        "!" | "!=" => Op::NotEqual,
        "<" => Op::Less,
        "<=" => Op::LessEqual,
        ">" => Op::Greater,
        ">=" => Op::GreaterEqual,
        other => return Err(CoreError::Query(format!("unknown comparison '{other}'"))),
    };
    Ok((op, modifiers))
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A conjunction of clauses. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub clauses: Vec<Clause>,
}

impl Query {
    /// The match-everything query (`*`).
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_clauses(clauses: Vec<Clause>) -> Self {
        Self { clauses }
    }

    pub fn is_match_all(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.clauses.iter().all(|c| c.matches(record))
    }

    /// Parse a complete query string (`*`, or one or more bracketed clauses).
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let (query, rest) = Self::parse_prefix(input)?;
        if !rest.trim().is_empty() {
            return Err(CoreError::Query(format!("trailing text after query: '{}'", rest.trim())));
        }
        Ok(query)
    }

    /// Parse a query at the start of `input`, returning it with the
    /// unconsumed remainder (the action part of a rule line).
    pub fn parse_prefix(input: &str) -> Result<(Self, &str), CoreError> {
        let mut rest = input.trim_start();
        if let Some(after) = rest.strip_prefix('*') {
            return Ok((Self::all(), after));
        }
        let mut clauses = Vec::new();
        while rest.starts_with('[') {
            let end = find_clause_end(rest)
                .ok_or_else(|| CoreError::Query(format!("unterminated clause in '{input}'")))?;
            clauses.push(Clause::parse_body(&rest[1..end])?);
            rest = rest[end + 1..].trim_start();
        }
        if clauses.is_empty() {
            return Err(CoreError::Query(format!("no query in '{input}'")));
        }
        Ok((Self { clauses }, rest))
    }

    /// Parse a single unbracketed clause such as `= Sender foo` or
    /// `T Facility` (console shorthand).
    pub fn parse_bare_clause(input: &str) -> Result<Self, CoreError> {
        Ok(Self {
            clauses: vec![Clause::parse_body(input.trim())?],
        })
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return f.write_str("*");
        }
        let mut first = true;
        for clause in &self.clauses {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{clause}")?;
        }
        Ok(())
    }
}

/// Index of the `]` closing the clause that opens at byte 0, honouring
/// backslash escapes and double quotes.
fn find_clause_end(s: &str) -> Option<usize> {
    let mut escaped = false;
    let mut quoted = false;
    for (i, c) in s.char_indices().skip(1) {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            ']' if !quoted => return Some(i),
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tokenizing helpers (shared with the rule grammar)
// ---------------------------------------------------------------------------

/// Whitespace tokenizer that understands double quotes and backslash escapes.
pub(crate) struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    pub(crate) fn next_token(&mut self) -> Option<String> {
        let bytes = self.input.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        if self.pos >= bytes.len() {
            return None;
        }
        let mut out = String::new();
        let mut quoted = false;
        let mut chars = self.input[self.pos..].char_indices();
        let mut consumed = self.input.len() - self.pos;
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, next)) = chars.next() {
                        out.push(unescape_char(next));
                    }
                }
                '"' => quoted = !quoted,
                c if c.is_whitespace() && !quoted => {
                    consumed = i;
                    break;
                }
                c => out.push(c),
            }
        }
        self.pos += consumed;
        Some(out)
    }

    pub(crate) fn rest(&self) -> &'a str {
        &self.input[self.pos.min(self.input.len())..]
    }
}

fn unescape_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        other => other,
    }
}

/// Strip one level of surrounding quotes and resolve backslash escapes.
pub(crate) fn unquote(s: &str) -> String {
    let inner = s
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(s);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(unescape_char(next));
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn quote_if_needed(s: &str) -> String {
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == ']' || c == '"') {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"").replace(']', "\\]"))
    } else {
        s.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::keys;
    use rstest::rstest;

    fn record() -> LogRecord {
        LogRecord::from_pairs([
            (keys::SENDER, "FooBar"),
            (keys::LEVEL, "3"),
            (keys::PID, "120"),
            (keys::MESSAGE, "disk full on /dev/disk0"),
        ])
    }

    #[rstest]
    #[case("[= Sender FooBar]", true)]
    #[case("[= Sender foobar]", false)]
    #[case("[C= Sender foobar]", true)]
    #[case("[! Sender FooBar]", false)]
    #[case("[!= Sender Other]", true)]
    #[case("[N< PID 200]", true)]
    #[case("[N> PID 200]", false)]
    #[case("[N>= PID 120]", true)]
    #[case("[< Level 4]", true)]
    #[case("[S= Message full]", true)]
    #[case("[A= Message disk]", true)]
    #[case("[Z= Message disk0]", true)]
    #[case("[CZ= Message DISK0]", true)]
    #[case("[R= Message ^disk .* on]", true)]
    #[case("[R! Message ^full]", true)]
    #[case("[T Facility]", false)]
    #[case("[T Sender]", true)]
    #[case("[= Sender FooBar] [N< Level 5]", true)]
    #[case("[= Sender FooBar] [N< Level 2]", false)]
    #[case("*", true)]
    fn clause_semantics(#[case] query: &str, #[case] expected: bool) {
        let q = Query::parse(query).expect("parse");
        assert_eq!(q.matches(&record()), expected, "{query}");
    }

    #[test]
    fn missing_key_never_matches() {
        let q = Query::parse("[! Facility kern]").expect("parse");
        assert!(!q.matches(&record()));
    }

    #[test]
    fn quoted_values_with_spaces_and_brackets() {
        let q = Query::parse(r#"[= Message "disk full on /dev/disk0"]"#).expect("parse");
        assert!(q.matches(&record()));
        let q = Query::parse(r"[S= Message a\]b]").expect("parse");
        assert_eq!(q.clauses[0].value.as_deref(), Some("a]b"));
    }

    #[test]
    fn parse_prefix_returns_action_text() {
        let (q, rest) = Query::parse_prefix("[= Sender foo] [T Facility] file /tmp/out").expect("parse");
        assert_eq!(q.clauses.len(), 2);
        assert_eq!(rest, "file /tmp/out");
    }

    #[test]
    fn display_round_trips() {
        for text in ["*", "[= Sender foo]", "[CS! Message \"a b\"]", "[T Facility]", "[N<= Level 3]"] {
            let q = Query::parse(text).expect("parse");
            let again = Query::parse(&q.to_string()).expect("reparse");
            assert_eq!(q, again, "{text}");
        }
    }

    #[test]
    fn bare_clause_for_console() {
        let q = Query::parse_bare_clause("= Sender FooBar").expect("parse");
        assert!(q.matches(&record()));
        let q = Query::parse_bare_clause("T Facility").expect("parse");
        assert!(!q.matches(&record()));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Query::parse("[= Sender foo").is_err());
        assert!(Query::parse("[Q Sender foo]").is_err());
        assert!(Query::parse("[= Sender]").is_err());
        assert!(Query::parse("[R= Message (]").is_err());
        assert!(Query::parse("Sender foo").is_err());
    }
}
