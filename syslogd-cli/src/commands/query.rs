//! `syslogd query` and `syslogd watch`: reading records back out.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use syslogd_core::{DaemonConfig, Direction, LogRecord};
use syslogd_daemon::{request_query, watch_stream};
use syslogd_render::{Formatter, TimeStyle};

/// Output options shared by `query` and `watch`.
#[derive(Args, Debug)]
pub struct OutputArgs {
    /// std, bsd, raw, msg, json, or a `$(Key)` template.
    #[arg(long, default_value = "std")]
    pub format: String,

    /// Time style for std/bsd output: sec, utc, lcl.
    #[arg(long = "time-format")]
    pub time_format: Option<String>,
}

impl OutputArgs {
    fn formatter(&self) -> Result<Formatter> {
        let formatter = Formatter::from_options(Some(&self.format), self.time_format.as_deref())
            .with_context(|| format!("invalid output format '{}'", self.format))?;
        // Legacy time has no year; queries span days, so show local time instead.
        if self.time_format.is_none() && formatter.time_style() == TimeStyle::Legacy {
            return Ok(Formatter::new(formatter.format_kind().clone(), TimeStyle::Local));
        }
        Ok(formatter)
    }
}

fn print_record(formatter: &Formatter, record: &LogRecord) -> Result<()> {
    let line = formatter
        .format(record)
        .context("failed to format record")?;
    print!("{}", line.text());
    Ok(())
}

fn join_query(words: &[String]) -> String {
    if words.is_empty() {
        "*".to_string()
    } else {
        words.join(" ")
    }
}

/// Arguments for `syslogd query`.
#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Query clauses, e.g. `[= Sender kernel] [<= Level 3]`. All records if empty.
    pub query: Vec<String>,

    /// First record id to consider.
    #[arg(long, default_value_t = 0)]
    pub start: u64,

    /// Maximum number of records; 0 for no limit.
    #[arg(long, default_value_t = 0)]
    pub count: usize,

    /// Newest first.
    #[arg(long)]
    pub reverse: bool,

    /// file, memory, mini or disaster; the primary store if unset.
    #[arg(long)]
    pub backend: Option<String>,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl QueryArgs {
    pub fn run(self, config: &DaemonConfig) -> Result<()> {
        let formatter = self.output.formatter()?;
        let direction = if self.reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        let query = join_query(&self.query);
        let reply = request_query(
            &config.rpc_socket(),
            &query,
            self.start,
            self.count,
            direction,
            self.backend,
        )
        .with_context(|| format!("query '{query}' failed"))?;

        for record in &reply.records {
            print_record(&formatter, record)?;
        }
        eprintln!(
            "{}",
            format!("{} records (last id {})", reply.records.len(), reply.last_id).bright_black()
        );
        Ok(())
    }
}

/// Arguments for `syslogd watch`.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Query clauses; every record if empty.
    pub query: Vec<String>,

    /// Replay stored matches from this id before streaming live ones.
    #[arg(long)]
    pub start: Option<u64>,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl WatchArgs {
    pub fn run(self, config: &DaemonConfig) -> Result<()> {
        let formatter = self.output.formatter()?;
        let query = join_query(&self.query);
        let mut failure = None;
        watch_stream(&config.rpc_socket(), &query, self.start, |_, record| {
            match print_record(&formatter, &record) {
                Ok(()) => true,
                Err(err) => {
                    failure = Some(err);
                    false
                }
            }
        })
        .with_context(|| format!("watch '{query}' failed"))?;
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
