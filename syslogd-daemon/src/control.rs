//! Live control lines.
//!
//! ```text
//! = reset
//! = name value
//! @ <module|*> enable [0|1]
//! @ <module|*> checkpoint [path]
//! @ <module> <rule line>
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::DaemonError;

/// Which modules an `@` line addresses. `*` leaves the default module out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Module(String),
}

impl Target {
    fn parse(word: &str) -> Target {
        if word == "*" {
            Target::All
        } else {
            Target::Module(word.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Reset,
    SetParam { name: String, value: String },
    Enable { target: Target, enabled: bool },
    Checkpoint { target: Target, path: Option<PathBuf> },
    DefineRule { module: String, line: String },
}

impl ControlLine {
    /// Whether a message body looks like a control line at all.
    pub fn is_control(text: &str) -> bool {
        matches!(text.trim_start().chars().next(), Some('=' | '@'))
    }
}

impl FromStr for ControlLine {
    type Err = DaemonError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| DaemonError::Control(format!("{why}: '{}'", line.trim()));
        let line = line.trim();

        if let Some(rest) = line.strip_prefix('=') {
            let rest = rest.trim();
            let (name, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            return match name {
                "" => Err(bad("missing parameter name")),
                "reset" => Ok(ControlLine::Reset),
                _ => Ok(ControlLine::SetParam {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                }),
            };
        }

        let Some(rest) = line.strip_prefix('@') else {
            return Err(bad("expected '=' or '@'"));
        };
        let rest = rest.trim();
        let (target, rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        if target.is_empty() {
            return Err(bad("missing module name"));
        }
        let rest = rest.trim();
        let (verb, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let args = args.trim();

        match verb {
            "" => Err(bad("missing module command")),
            "enable" => {
                let enabled = match args {
                    "" | "1" => true,
                    "0" => false,
                    _ => return Err(bad("enable takes 0 or 1")),
                };
                Ok(ControlLine::Enable {
                    target: Target::parse(target),
                    enabled,
                })
            }
            "checkpoint" => Ok(ControlLine::Checkpoint {
                target: Target::parse(target),
                path: (!args.is_empty()).then(|| PathBuf::from(args)),
            }),
            _ if target == "*" => Err(bad("rules cannot be added to every module")),
            _ => Ok(ControlLine::DefineRule {
                module: target.to_string(),
                line: rest.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(line: &str) -> ControlLine {
        line.parse().expect("control line")
    }

    #[test]
    fn parameter_lines() {
        assert_eq!(parse("= reset"), ControlLine::Reset);
        assert_eq!(
            parse("= debug 1 /tmp/d.log"),
            ControlLine::SetParam {
                name: "debug".into(),
                value: "1 /tmp/d.log".into()
            }
        );
        assert_eq!(
            parse("=mps_limit 10"),
            ControlLine::SetParam {
                name: "mps_limit".into(),
                value: "10".into()
            }
        );
    }

    #[rstest]
    #[case("@ com.example enable", Target::Module("com.example".into()), true)]
    #[case("@ com.example enable 0", Target::Module("com.example".into()), false)]
    #[case("@ * enable 1", Target::All, true)]
    fn enable_lines(#[case] line: &str, #[case] target: Target, #[case] enabled: bool) {
        assert_eq!(parse(line), ControlLine::Enable { target, enabled });
    }

    #[test]
    fn checkpoint_and_rule_lines() {
        assert_eq!(
            parse("@ * checkpoint"),
            ControlLine::Checkpoint {
                target: Target::All,
                path: None
            }
        );
        assert_eq!(
            parse("@ m checkpoint /var/log/m.log"),
            ControlLine::Checkpoint {
                target: Target::Module("m".into()),
                path: Some(PathBuf::from("/var/log/m.log"))
            }
        );
        assert_eq!(
            parse("@ m ? [= Sender foo] file /tmp/foo"),
            ControlLine::DefineRule {
                module: "m".into(),
                line: "? [= Sender foo] file /tmp/foo".into()
            }
        );
    }

    #[rstest]
    #[case("")]
    #[case("=")]
    #[case("@")]
    #[case("@ m")]
    #[case("@ m enable 2")]
    #[case("@ * ? [= Sender foo] skip")]
    #[case("hello")]
    fn rejects(#[case] line: &str) {
        assert!(line.parse::<ControlLine>().is_err());
    }

    #[test]
    fn detects_control_bodies() {
        assert!(ControlLine::is_control("= reset"));
        assert!(ControlLine::is_control("  @ * enable 0"));
        assert!(!ControlLine::is_control("hello = world"));
    }
}
