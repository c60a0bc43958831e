//! Module rule files.
//!
//! # Line grammar
//!
//! ```text
//! # comment
//! = name value                      set a runtime parameter
//! = [exists /path] name value       ... only if /path exists
//! > /path option option ...         declare a destination and its options
//! ? [query] action [args] [options] rule (also "Q", "*", or a bare "[")
//! ```
//!
//! Actions: `store`, `store_directory` (`directory`), `file`, `notify`,
//! `broadcast`, `access`, `ignore`, `skip`, `claim [only]`, `none`,
//! `control`, `set key value`.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{io_err, CoreError};
use crate::query::{unquote, Query, Tokenizer};

/// Name of the default module; it always exists and is always first.
pub const DEFAULT_MODULE: &str = "com.apple.asl";

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// What a rule does once its query matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Continue with the next rule.
    None,
    /// Stop processing this record entirely (the default module treats it
    /// like `skip`).
    Ignore,
    /// Stop processing this module only.
    Skip,
    /// Mark the module as wanting exclusive handling of matching records.
    Claim { only: bool },
    /// Save to the main store (`path == None`) or to a record file.
    Store { path: Option<PathBuf> },
    /// Save to a directory of per-day record files.
    StoreDirectory { path: PathBuf },
    /// Write a formatted line to a text file.
    File { path: PathBuf },
    /// Post a change notification under `key`.
    Notify { key: String },
    /// Write a formatted line to terminals (or to `target`).
    Broadcast { target: Option<PathBuf> },
    /// Restrict who may read the record.
    Access { uid: Option<i64>, gid: Option<i64> },
    /// Treat the record's message as a control line.
    Control,
    /// Set a runtime parameter.
    SetParam { name: String, value: String },
    /// Set a runtime parameter only if `path` exists.
    SetParamIfExists {
        path: PathBuf,
        name: String,
        value: String,
    },
    /// Set a key on the record before later rules see it.
    SetKey { key: String, value: String },
    /// `>` line: declare a destination's options.
    DeclareDestination { path: PathBuf },
}

impl Action {
    /// Destination path the action writes to, if any.
    pub fn destination(&self) -> Option<&Path> {
        match self {
            Action::Store { path: Some(path) }
            | Action::StoreDirectory { path }
            | Action::File { path }
            | Action::DeclareDestination { path } => Some(path),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Ignore => "ignore",
            Action::Skip => "skip",
            Action::Claim { .. } => "claim",
            Action::Store { .. } => "store",
            Action::StoreDirectory { .. } => "store_directory",
            Action::File { .. } => "file",
            Action::Notify { .. } => "notify",
            Action::Broadcast { .. } => "broadcast",
            Action::Access { .. } => "access",
            Action::Control => "control",
            Action::SetParam { .. } | Action::SetParamIfExists { .. } => "=",
            Action::SetKey { .. } => "set",
            Action::DeclareDestination { .. } => ">",
        }
    }
}

/// A query plus the action it triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub query: Query,
    pub action: Action,
    /// Free-form options text following the action's arguments.
    pub options: String,
    /// 1-based line number in the source file (0 for synthesized rules).
    pub line: usize,
}

impl Rule {
    pub fn new(query: Query, action: Action) -> Self {
        Self {
            query,
            action,
            options: String::new(),
            line: 0,
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    /// Parse one rule-file line. Blank lines and comments yield `None`.
    pub fn parse_line(line: &str, line_no: usize) -> Result<Option<Rule>, CoreError> {
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            return Ok(None);
        }
        let err = |reason: String| CoreError::Rule {
            line: line_no,
            reason,
        };

        let rule = if let Some(rest) = text.strip_prefix('=') {
            parse_param_line(rest.trim()).map_err(err)?
        } else if let Some(rest) = text.strip_prefix('>') {
            let mut tokens = Tokenizer::new(rest);
            let path = tokens
                .next_token()
                .ok_or_else(|| err("'>' needs a path".to_string()))?;
            Rule::new(
                Query::all(),
                Action::DeclareDestination {
                    path: PathBuf::from(path),
                },
            )
            .with_options(tokens.rest().trim())
        } else {
            let body = if let Some(rest) = text.strip_prefix('?') {
                rest
            } else if let Some(rest) = text.strip_prefix('Q') {
                rest
            } else if text.starts_with('*') || text.starts_with('[') {
                text
            } else {
                return Err(err(format!("unrecognized line '{text}'")));
            };
            let (query, action_text) = Query::parse_prefix(body).map_err(|e| err(e.to_string()))?;
            let (action, options) = parse_action(action_text.trim()).map_err(err)?;
            Rule::new(query, action).with_options(options)
        };

        Ok(Some(Rule {
            line: line_no,
            ..rule
        }))
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Action::SetParam { name, value } => write!(f, "= {name} {value}"),
            Action::SetParamIfExists { path, name, value } => {
                write!(f, "= [exists {}] {name} {value}", path.display())
            }
            Action::DeclareDestination { path } => {
                write!(f, "> {} {}", path.display(), self.options)
            }
            action => {
                write!(f, "? {} {}", self.query, action.keyword())?;
                match action {
                    Action::Store { path: Some(path) }
                    | Action::StoreDirectory { path }
                    | Action::File { path } => write!(f, " {}", path.display())?,
                    Action::Broadcast { target: Some(path) } => write!(f, " {}", path.display())?,
                    Action::Notify { key } => write!(f, " {key}")?,
                    Action::SetKey { key, value } => write!(f, " {key} {value}")?,
                    Action::Claim { only: true } => f.write_str(" only")?,
                    Action::Access { uid, gid } => {
                        if let Some(uid) = uid {
                            write!(f, " {uid}")?;
                        }
                        if let Some(gid) = gid {
                            write!(f, " {gid}")?;
                        }
                    }
                    _ => {}
                }
                if !self.options.is_empty() {
                    write!(f, " {}", self.options)?;
                }
                Ok(())
            }
        }
    }
}

fn parse_param_line(rest: &str) -> Result<Rule, String> {
    let (guard, rest) = match rest.strip_prefix('[') {
        Some(inner) => {
            let end = inner
                .find(']')
                .ok_or_else(|| "unterminated '[' in parameter line".to_string())?;
            let mut tokens = Tokenizer::new(&inner[..end]);
            match tokens.next_token().as_deref() {
                Some("exists") => {}
                other => return Err(format!("unknown parameter guard {other:?}")),
            }
            let path = tokens
                .next_token()
                .ok_or_else(|| "'exists' guard needs a path".to_string())?;
            (Some(PathBuf::from(path)), inner[end + 1..].trim())
        }
        None => (None, rest),
    };

    let mut tokens = Tokenizer::new(rest);
    let name = tokens
        .next_token()
        .ok_or_else(|| "'=' needs a parameter name".to_string())?;
    let value = unquote(tokens.rest().trim());
    let action = match guard {
        Some(path) => Action::SetParamIfExists { path, name, value },
        None => Action::SetParam { name, value },
    };
    Ok(Rule::new(Query::all(), action))
}

fn parse_action(text: &str) -> Result<(Action, String), String> {
    let mut tokens = Tokenizer::new(text);
    let keyword = tokens
        .next_token()
        .ok_or_else(|| "rule has no action".to_string())?
        .to_ascii_lowercase();

    let action = match keyword.as_str() {
        "none" => Action::None,
        "ignore" => Action::Ignore,
        "skip" => Action::Skip,
        "control" => Action::Control,
        "file" => Action::File {
            path: required_path(&mut tokens, "file")?,
        },
        "store_directory" | "directory" | "store_dir" => Action::StoreDirectory {
            path: required_path(&mut tokens, "store_directory")?,
        },
        "store" | "asl_file" => {
            let mut peek = Tokenizer::new(tokens.rest());
            match peek.next_token() {
                Some(path) if path.starts_with('/') => {
                    tokens.next_token();
                    Action::Store {
                        path: Some(PathBuf::from(path)),
                    }
                }
                _ => Action::Store { path: None },
            }
        }
        "broadcast" => {
            let mut peek = Tokenizer::new(tokens.rest());
            match peek.next_token() {
                Some(path) if path.starts_with('/') => {
                    tokens.next_token();
                    Action::Broadcast {
                        target: Some(PathBuf::from(path)),
                    }
                }
                _ => Action::Broadcast { target: None },
            }
        }
        "notify" => Action::Notify {
            key: tokens
                .next_token()
                .ok_or_else(|| "'notify' needs a key".to_string())?,
        },
        "claim" => {
            let rest: Vec<String> = std::iter::from_fn(|| tokens.next_token()).collect();
            let only = rest.iter().any(|t| t == "only");
            let options: Vec<String> = rest.into_iter().filter(|t| t != "only").collect();
            return Ok((Action::Claim { only }, options.join(" ")));
        }
        "access" => {
            let mut uid = None;
            let mut gid = None;
            let mut positional = Vec::new();
            while let Some(tok) = tokens.next_token() {
                if let Some(v) = tok.strip_prefix("uid=") {
                    uid = v.parse().ok();
                } else if let Some(v) = tok.strip_prefix("gid=") {
                    gid = v.parse().ok();
                } else if let Ok(n) = tok.parse::<i64>() {
                    positional.push(n);
                }
            }
            let mut positional = positional.into_iter();
            Action::Access {
                uid: uid.or_else(|| positional.next()),
                gid: gid.or_else(|| positional.next()),
            }
        }
        "set" => {
            let key = tokens
                .next_token()
                .ok_or_else(|| "'set' needs a key".to_string())?;
            let value = unquote(tokens.rest().trim());
            return Ok((Action::SetKey { key, value }, String::new()));
        }
        other => return Err(format!("unknown action '{other}'")),
    };
    Ok((action, tokens.rest().trim().to_string()))
}

fn required_path(tokens: &mut Tokenizer<'_>, what: &str) -> Result<PathBuf, String> {
    tokens
        .next_token()
        .map(PathBuf::from)
        .ok_or_else(|| format!("'{what}' needs a path"))
}

// ---------------------------------------------------------------------------
// Destination options
// ---------------------------------------------------------------------------

/// How rotated files are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStyle {
    /// `name.1`, `name.2`, … newest first.
    #[default]
    Sequenced,
    /// `name.<epoch-seconds>`.
    Seconds,
    /// `name.<YYYYMMDDTHHMMSSZ>`.
    Utc,
    /// `name.<YYYYMMDDTHHMMSS>` in local time.
    Local,
}

impl RotationStyle {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "seq" | "sequenced" => Some(Self::Sequenced),
            "sec" | "seconds" => Some(Self::Seconds),
            "utc" | "zulu" => Some(Self::Utc),
            "lcl" | "local" => Some(Self::Local),
            _ => None,
        }
    }
}

/// Options attached to a destination by its `>` declaration or by the
/// options text of the first rule that names it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DestinationOptions {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Output format name (`std`, `bsd`, `raw`, `msg`) or template.
    pub format: Option<String>,
    /// Time style for formatted output (`sec`, `utc`, `lcl`).
    pub time_format: Option<String>,
    pub rotate: bool,
    pub file_max: Option<u64>,
    pub all_max: Option<u64>,
    pub ttl_days: Option<u32>,
    pub style: RotationStyle,
    /// Duplicate suppression; defaults to on for text files.
    pub coalesce: Option<bool>,
    /// Failures never disable the destination.
    pub soft: bool,
    pub compress: bool,
    /// Unrecognized tokens, kept for diagnostics.
    pub unknown: Vec<String>,
}

impl DestinationOptions {
    pub fn parse(text: &str) -> Self {
        let mut opts = Self::default();
        let mut tokens = Tokenizer::new(text);
        while let Some(tok) = tokens.next_token() {
            let (key, value) = match tok.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (tok.clone(), None),
            };
            match (key.as_str(), value) {
                ("mode", Some(v)) => opts.mode = u32::from_str_radix(v.trim_start_matches("0o"), 8).ok(),
                ("uid", Some(v)) => opts.uid = v.parse().ok(),
                ("gid", Some(v)) => opts.gid = v.parse().ok(),
                ("format" | "fmt", Some(v)) => opts.format = Some(v),
                ("time_format", Some(v)) => opts.time_format = Some(v),
                ("rotate", None) => opts.rotate = true,
                ("file_max", Some(v)) => {
                    opts.file_max = parse_size(&v);
                    opts.rotate = true;
                }
                ("all_max", Some(v)) => opts.all_max = parse_size(&v),
                ("ttl", Some(v)) => opts.ttl_days = v.parse().ok(),
                ("style", Some(v)) => {
                    if let Some(style) = RotationStyle::parse(&v) {
                        opts.style = style;
                    }
                }
                ("coalesce", v) => opts.coalesce = Some(v.map(|v| v != "0").unwrap_or(true)),
                ("soft", None) => opts.soft = true,
                ("compress", None) => opts.compress = true,
                _ => opts.unknown.push(tok),
            }
        }
        opts
    }

    /// Merge `other` over `self`: anything set in `other` wins.
    pub fn merged_with(&self, other: &DestinationOptions) -> DestinationOptions {
        DestinationOptions {
            mode: other.mode.or(self.mode),
            uid: other.uid.or(self.uid),
            gid: other.gid.or(self.gid),
            format: other.format.clone().or_else(|| self.format.clone()),
            time_format: other.time_format.clone().or_else(|| self.time_format.clone()),
            rotate: self.rotate || other.rotate,
            file_max: other.file_max.or(self.file_max),
            all_max: other.all_max.or(self.all_max),
            ttl_days: other.ttl_days.or(self.ttl_days),
            style: if other.style != RotationStyle::default() {
                other.style
            } else {
                self.style
            },
            coalesce: other.coalesce.or(self.coalesce),
            soft: self.soft || other.soft,
            compress: self.compress || other.compress,
            unknown: self.unknown.iter().chain(&other.unknown).cloned().collect(),
        }
    }
}

/// Parse a size with an optional `k`/`m`/`g` suffix (powers of 1024).
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last()?.to_ascii_lowercase() {
        'k' => (&s[..s.len() - 1], 1024),
        'm' => (&s[..s.len() - 1], 1024 * 1024),
        'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * mult)
}

// ---------------------------------------------------------------------------
// Module configuration
// ---------------------------------------------------------------------------

/// A parsed module: a name, an enabled flag, and ordered rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    pub name: String,
    pub enabled: bool,
    pub rules: Vec<Rule>,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            rules: Vec::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_MODULE
    }

    /// Parse a whole rule file. Bad lines are returned alongside the module
    /// so the caller can report them; they never abort the parse.
    pub fn parse(name: impl Into<String>, text: &str) -> (Self, Vec<CoreError>) {
        let mut module = Self::new(name);
        let mut errors = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            match Rule::parse_line(line, idx + 1) {
                Ok(Some(rule)) => module.rules.push(rule),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        (module, errors)
    }

    /// Load a rule file, naming the module after the file unless `name` is
    /// given.
    pub fn load_at(path: &Path, name: Option<&str>) -> Result<(Self, Vec<CoreError>), CoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let name = name.map(str::to_string).unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        });
        Ok(Self::parse(name, &text))
    }

    /// Append one line to the module (used by `@ module <line>`).
    pub fn push_line(&mut self, line: &str) -> Result<(), CoreError> {
        if let Some(rule) = Rule::parse_line(line, self.rules.len() + 1)? {
            self.rules.push(rule);
        }
        Ok(())
    }

    /// Does any rule claim records for this module?
    pub fn claims(&self) -> impl Iterator<Item = &Rule> {
        self.rules
            .iter()
            .filter(|r| matches!(r.action, Action::Claim { .. }))
    }

    /// Options declared for `path` by `>` lines and by the options text of
    /// rules writing to it, in file order.
    pub fn options_for(&self, path: &Path) -> DestinationOptions {
        self.rules
            .iter()
            .filter(|r| r.action.destination() == Some(path))
            .fold(DestinationOptions::default(), |acc, r| {
                acc.merged_with(&DestinationOptions::parse(&r.options))
            })
    }
}

/// Rules the default module always starts with, ahead of `asl.conf`.
pub fn builtin_default_rules() -> &'static str {
    "# built-in defaults\n\
     ? [= Facility com.apple.asl] [= UID 0] [A= Message =] control\n\
     ? [= Facility com.apple.asl] [= UID 0] [A= Message @] control\n\
     ? [= Facility com.apple.asl] [= UID 0] [A= Message =] skip\n\
     ? [= Facility com.apple.asl] [= UID 0] [A= Message @] skip\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
