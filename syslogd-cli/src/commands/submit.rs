//! `syslogd submit` and `syslogd control`: writing to the daemon.

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;

use syslogd_core::{keys, DaemonConfig, Level, LogRecord};
use syslogd_daemon::{control, submit};

/// Arguments for `syslogd submit`.
#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Message text; words are joined with spaces.
    #[arg(required = true)]
    pub message: Vec<String>,

    #[arg(long, default_value = "syslogd-cli")]
    pub sender: String,

    /// Level as 0-7 or a name (`error`, `notice`, ...).
    #[arg(long, default_value = "notice")]
    pub level: String,

    #[arg(long)]
    pub facility: Option<String>,

    /// Extra `Key=Value` pairs.
    #[arg(long = "key", value_name = "KEY=VALUE")]
    pub keys: Vec<String>,
}

impl SubmitArgs {
    pub fn run(self, config: &DaemonConfig) -> Result<()> {
        let record = self.record()?;
        let status = submit(&config.rpc_socket(), record).context("failed to submit record")?;
        println!("{status}");
        Ok(())
    }

    fn record(&self) -> Result<LogRecord> {
        let level: Level = self
            .level
            .parse()
            .map_err(|_| anyhow!("unknown level '{}'", self.level))?;
        let mut record = LogRecord::from_pairs([
            (keys::SENDER, self.sender.clone()),
            (keys::LEVEL, level.as_digit().to_string()),
            (keys::MESSAGE, self.message.join(" ")),
        ]);
        if let Some(facility) = &self.facility {
            record.set(keys::FACILITY, facility.clone());
        }
        for pair in &self.keys {
            let Some((key, value)) = pair.split_once('=') else {
                bail!("expected KEY=VALUE, got '{pair}'");
            };
            if key.is_empty() {
                bail!("empty key in '{pair}'");
            }
            record.set(key, value);
        }
        Ok(record)
    }
}

/// Arguments for `syslogd control`.
#[derive(Args, Debug)]
pub struct ControlArgs {
    /// The control line, e.g. `= mps_limit 100` or `@ * checkpoint`.
    #[arg(required = true, allow_hyphen_values = true)]
    pub line: Vec<String>,
}

impl ControlArgs {
    pub fn run(self, config: &DaemonConfig) -> Result<()> {
        let line = self.line.join(" ");
        control(&config.rpc_socket(), &line)
            .with_context(|| format!("control line '{line}' rejected"))?;
        println!("applied: {line}");
        Ok(())
    }
}
